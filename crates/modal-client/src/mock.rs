//! A deterministic, I/O-free backend
//!
//! The mock returns synthetic ids derived from the request name
//! (`mock-app-<name>`) and keeps everything it was asked to do in memory so
//! tests can assert on it. It is the default client in test environments
//! and is selected in deployments with `--mock` / `MODAL_MOCK=true`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use crate::api::{
    AppState, AppStatus, DeployedApp, EndpointDeployed, EndpointRequest, FunctionDeployed,
    FunctionRequest, JobCreated, JobRequest, LogStream, ModalApi,
};
use crate::errors::BackendError;

#[derive(Clone, Debug)]
struct MockApp {
    name: String,
    state: AppState,
    exit_code: Option<i32>,
    deployed: bool,
    gpu: Option<String>,
}

/// In-memory stand-in for the backend.
#[derive(Default)]
pub struct MockClient {
    apps: Mutex<BTreeMap<String, MockApp>>,
    registry: Mutex<BTreeMap<String, String>>,
    jobs: Mutex<Vec<JobRequest>>,
    functions: Mutex<Vec<FunctionRequest>>,
    endpoints: Mutex<Vec<EndpointRequest>>,
}

impl MockClient {
    /// Create an empty mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job request this mock has accepted, in order.
    pub fn jobs(&self) -> Vec<JobRequest> {
        self.jobs.lock().unwrap().clone()
    }

    /// Every function request this mock has accepted, in order.
    pub fn functions(&self) -> Vec<FunctionRequest> {
        self.functions.lock().unwrap().clone()
    }

    /// Every endpoint request this mock has accepted, in order.
    pub fn endpoints(&self) -> Vec<EndpointRequest> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Whether the app is still known to the mock backend.
    pub fn has_app(&self, app_id: &str) -> bool {
        self.apps.lock().unwrap().contains_key(app_id)
    }

    /// Drive a job to a terminal state, as the remote execution would.
    pub fn complete_job(&self, app_id: &str, exit_code: i32) {
        if let Some(app) = self.apps.lock().unwrap().get_mut(app_id) {
            app.state = if exit_code == 0 {
                AppState::Succeeded
            } else {
                AppState::Failed
            };
            app.exit_code = Some(exit_code);
        }
    }

    /// Pre-register a deployed app, as a prior endpoint deployment would
    /// have left behind.
    pub fn seed_deployed_app(&self, app_id: &str, name: &str) {
        self.insert_app(app_id, name, true, None);
    }

    fn insert_app(&self, app_id: &str, name: &str, deployed: bool, gpu: Option<String>) {
        self.apps.lock().unwrap().insert(
            app_id.to_owned(),
            MockApp {
                name: name.to_owned(),
                state: AppState::Running,
                exit_code: None,
                deployed,
                gpu,
            },
        );
    }
}

#[async_trait]
impl ModalApi for MockClient {
    async fn create_job(&self, req: &JobRequest) -> Result<JobCreated, BackendError> {
        let app_id = format!("mock-app-{}", req.name);
        self.insert_app(&app_id, &req.name, false, req.gpu.clone());

        // Replicas of a cluster-networked job register their addresses as
        // they come up; the mock registers all of them immediately.
        if req.cluster_networking {
            let mut registry = self.registry.lock().unwrap();
            for task in &req.tasks {
                registry.insert(
                    format!("{}-replica-{}", req.name, task.rank),
                    format!("fdaa::{}", task.rank + 1),
                );
            }
        }

        self.jobs.lock().unwrap().push(req.clone());
        Ok(JobCreated {
            app_id,
            function_id: format!("mock-func-{}", req.name),
            tunnel_url: req
                .gpu
                .as_ref()
                .map(|_| format!("https://mock-tunnel-{}.modal.run", req.name)),
        })
    }

    async fn create_function(
        &self,
        req: &FunctionRequest,
    ) -> Result<FunctionDeployed, BackendError> {
        let app_id = format!("mock-app-{}", req.name);
        self.insert_app(&app_id, &req.name, true, req.gpu.clone());
        self.functions.lock().unwrap().push(req.clone());
        Ok(FunctionDeployed {
            app_id,
            function_url: format!("https://{}.modal.run", req.name),
        })
    }

    async fn create_endpoint(
        &self,
        req: &EndpointRequest,
    ) -> Result<EndpointDeployed, BackendError> {
        let deployment = format!("{}-endpoint", req.name);
        let app_id = format!("mock-app-{}", deployment);
        self.insert_app(&app_id, &deployment, true, req.gpu.clone());
        self.endpoints.lock().unwrap().push(req.clone());
        Ok(EndpointDeployed {
            app_id,
            endpoint_url: format!("https://{}.modal.run", deployment),
        })
    }

    async fn app_status(&self, app_id: &str) -> Result<AppStatus, BackendError> {
        let apps = self.apps.lock().unwrap();
        let app = apps.get(app_id).ok_or(BackendError::NotFound {
            kind: "app",
            id: app_id.to_owned(),
        })?;
        Ok(AppStatus {
            state: app.state,
            exit_code: app.exit_code,
            message: None,
            // A running GPU app reports a fixed synthetic utilization.
            gpu_utilization: match (app.state, &app.gpu) {
                (AppState::Running, Some(_)) => Some(82.5),
                _ => None,
            },
        })
    }

    async fn cancel_job(&self, app_id: &str, _function_id: &str) -> Result<(), BackendError> {
        let mut apps = self.apps.lock().unwrap();
        match apps.get_mut(app_id) {
            Some(app) => {
                app.state = AppState::Stopped;
                Ok(())
            }
            None => Err(BackendError::NotFound {
                kind: "app",
                id: app_id.to_owned(),
            }),
        }
    }

    async fn delete_app(&self, app_id: &str) -> Result<(), BackendError> {
        match self.apps.lock().unwrap().remove(app_id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound {
                kind: "app",
                id: app_id.to_owned(),
            }),
        }
    }

    async fn list_deployed_apps(&self) -> Result<Vec<DeployedApp>, BackendError> {
        Ok(self
            .apps
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, app)| app.deployed)
            .map(|(app_id, app)| DeployedApp {
                app_id: app_id.clone(),
                name: app.name.clone(),
            })
            .collect())
    }

    async fn stream_app_logs(&self, app_id: &str) -> Result<LogStream, BackendError> {
        if !self.has_app(app_id) {
            return Err(BackendError::NotFound {
                kind: "app",
                id: app_id.to_owned(),
            });
        }
        let lines = vec![
            Ok(format!("starting app {}", app_id)),
            Ok(format!("app {} completed", app_id)),
        ];
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn replica_addresses(
        &self,
        job_name: &str,
    ) -> Result<BTreeMap<u32, String>, BackendError> {
        let prefix = format!("{}-replica-", job_name);
        Ok(self
            .registry
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(key, addr)| {
                key.strip_prefix(&prefix)
                    .and_then(|suffix| suffix.parse::<u32>().ok())
                    .map(|rank| (rank, addr.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::JobTask;
    use futures::StreamExt;

    fn job_request(name: &str, replicas: u32, cluster_networking: bool) -> JobRequest {
        let tasks = (0..replicas)
            .map(|rank| JobTask {
                rank,
                world_size: replicas,
                command: vec!["python".to_owned()],
                args: vec!["train.py".to_owned()],
                env: BTreeMap::new(),
            })
            .collect();
        JobRequest {
            name: name.to_owned(),
            image: "pytorch/pytorch:latest".to_owned(),
            cpu: "1.0".to_owned(),
            memory_mib: 1024,
            gpu: Some("T4:1".to_owned()),
            timeout_seconds: 600,
            retries: 0,
            cluster_networking,
            tasks,
        }
    }

    #[tokio::test]
    async fn job_ids_are_deterministic() {
        let mock = MockClient::new();
        let created = mock.create_job(&job_request("train", 1, false)).await.unwrap();
        assert_eq!(created.app_id, "mock-app-train");
        assert_eq!(created.function_id, "mock-func-train");
        assert!(created.tunnel_url.unwrap().contains("mock-tunnel-train"));
    }

    #[tokio::test]
    async fn distributed_jobs_register_replicas() {
        let mock = MockClient::new();
        mock.create_job(&job_request("dist", 3, true)).await.unwrap();
        let addresses = mock.replica_addresses("dist").await.unwrap();
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[&0], "fdaa::1");
    }

    #[tokio::test]
    async fn gpu_jobs_report_utilization_while_running() {
        let mock = MockClient::new();
        mock.create_job(&job_request("gpu", 1, false)).await.unwrap();
        let status = mock.app_status("mock-app-gpu").await.unwrap();
        assert_eq!(status.gpu_utilization, Some(82.5));

        mock.complete_job("mock-app-gpu", 0);
        let done = mock.app_status("mock-app-gpu").await.unwrap();
        assert_eq!(done.gpu_utilization, None);
    }

    #[tokio::test]
    async fn delete_is_not_found_after_removal() {
        let mock = MockClient::new();
        mock.create_job(&job_request("once", 1, false)).await.unwrap();
        mock.delete_app("mock-app-once").await.unwrap();
        let err = mock.delete_app("mock-app-once").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn endpoint_orphans_are_listed() {
        let mock = MockClient::new();
        mock.seed_deployed_app("mock-app-old", "serve-endpoint");
        let apps = mock.list_deployed_apps().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "serve-endpoint");
    }

    #[tokio::test]
    async fn log_stream_yields_lines() {
        let mock = MockClient::new();
        mock.create_job(&job_request("logged", 1, false)).await.unwrap();
        let stream = mock.stream_app_logs("mock-app-logged").await.unwrap();
        let lines: Vec<_> = stream.collect().await;
        assert_eq!(lines.len(), 2);
        assert!(lines[0].as_ref().unwrap().contains("starting"));
    }
}
