//! Reconciler for `ModalJob`
//!
//! Translates the job spec into a backend submission, records the
//! assigned ids on the status subresource, and keeps a monitor running
//! until the remote execution reaches a terminal state. Deletion stops
//! the remote app before the finalizer is released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use modal_client::{BackendError, JobRequest, ModalApi};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{
    call_backend, ensure_finalizer, remove_finalizer, run_controller, unless_deleted, EventHandler,
};
use crate::crd::{Condition, JobPhase, ModalJob, ModalJobStatus};
use crate::metrics::Metrics;
use crate::translate::{expand_replicas, parse_cpu, parse_gpu, parse_memory_mib, TranslationError};

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Drives `ModalJob` resources against the backend.
pub struct JobController {
    client: kube::Client,
    modal: Arc<dyn ModalApi>,
    metrics: Arc<Metrics>,
}

impl JobController {
    /// Create the controller.
    pub fn new(client: kube::Client, modal: Arc<dyn ModalApi>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(JobController {
            client,
            modal,
            metrics,
        })
    }

    /// Watch `ModalJob` resources until the stream ends.
    pub async fn run(self: Arc<Self>) {
        let api: Api<ModalJob> = Api::all(self.client.clone());
        info!("Starting ModalJob controller");
        run_controller(api, self as Arc<dyn EventHandler<ModalJob>>).await;
    }

    #[instrument(level = "info", skip(self, job, deleted), fields(name = %job.name(), namespace = ?job.namespace()))]
    async fn reconcile(&self, job: ModalJob, deleted: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = job.name();
        let namespace = job.namespace().unwrap_or_else(|| "default".to_owned());
        let api: Api<ModalJob> = Api::namespaced(self.client.clone(), &namespace);

        if job.metadata.deletion_timestamp.is_some() {
            self.teardown(&job).await;
            remove_finalizer(&api, &job).await?;
            return Ok(());
        }

        // The remote app id is written exactly once; a job that already has
        // one has nothing left to reconcile (no spec field is mutable).
        if job
            .status
            .as_ref()
            .and_then(|s| s.remote_app_id.as_ref())
            .is_some()
        {
            debug!("Job already submitted, nothing to do");
            return Ok(());
        }

        ensure_finalizer(&api, &job).await?;
        self.metrics.record_job_queued(&name);

        let request = match build_request(&job) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Job spec failed translation");
                self.metrics.record_error(&e.reason(), "job_controller");
                self.patch_status(
                    &api,
                    &name,
                    ModalJobStatus {
                        phase: JobPhase::Failed,
                        conditions: vec![Condition::not_ready(&e.reason(), &e.to_string())],
                        ..Default::default()
                    },
                )
                .await;
                return Ok(());
            }
        };

        let gpu_type = gpu_type_of(&job);
        let timeout = Duration::from_secs(u64::from(job.spec.timeout_seconds.max(1)));
        let created = match unless_deleted(
            deleted,
            tokio::time::timeout(timeout, call_backend(|| self.modal.create_job(&request))),
        )
        .await
        {
            None => {
                debug!("Job deleted while submission was in flight");
                return Ok(());
            }
            Some(Err(_)) => {
                self.metrics.record_error("timeout", "job_controller");
                self.fail(&api, &name, "BackendUnavailable", "job submission timed out")
                    .await;
                return Ok(());
            }
            Some(Ok(Err(e))) => {
                let reason = match e {
                    BackendError::Unavailable(_) | BackendError::Credentials(_) => {
                        "BackendUnavailable"
                    }
                    _ => "CreationFailed",
                };
                self.metrics.record_error(reason, "modal_client");
                self.fail(&api, &name, reason, &e.to_string()).await;
                return Ok(());
            }
            Some(Ok(Ok(created))) => created,
        };

        let log_url = format!("https://modal.com/apps/{}", created.app_id);
        let mut message = format!(
            "Modal job created successfully. View logs at {}",
            log_url
        );
        if request.cluster_networking {
            // Registry entries appear as replicas come up; report whatever
            // is visible right now.
            match self.modal.replica_addresses(&name).await {
                Ok(addresses) => {
                    message = format!(
                        "{} ({}/{} replicas registered)",
                        message,
                        addresses.len(),
                        request.tasks.len()
                    );
                }
                Err(e) => debug!(error = %e, "Replica registry not readable yet"),
            }
        }

        info!(app_id = %created.app_id, function_id = %created.function_id, "Modal job created");
        self.metrics
            .record_job_created(&name, gpu_type.as_deref(), job.spec.replicas);
        self.metrics.record_job_started(&name, gpu_type.as_deref());
        if let Some(gpu) = gpu_type.as_deref() {
            self.metrics.record_cold_start(&name, gpu);
        }

        let now = crate::crd::now_rfc3339();
        self.patch_status(
            &api,
            &name,
            ModalJobStatus {
                phase: JobPhase::Running,
                remote_app_id: Some(created.app_id.clone()),
                remote_function_id: Some(created.function_id),
                tunnel_url: created.tunnel_url,
                log_url: Some(log_url),
                created_at: Some(now.clone()),
                started_at: Some(now),
                conditions: vec![Condition::ready("JobCreated", &message)],
                ..Default::default()
            },
        )
        .await;

        self.spawn_monitor(namespace, name, created.app_id, gpu_type);
        Ok(())
    }

    async fn fail(&self, api: &Api<ModalJob>, name: &str, reason: &str, message: &str) {
        error!(%reason, %message, "Job creation failed");
        self.patch_status(
            api,
            name,
            ModalJobStatus {
                phase: JobPhase::Failed,
                conditions: vec![Condition::not_ready(reason, message)],
                ..Default::default()
            },
        )
        .await;
    }

    /// Patch the status subresource. A failed status write is logged and
    /// counted but never propagated; the submission itself may well have
    /// succeeded.
    async fn patch_status(&self, api: &Api<ModalJob>, name: &str, status: ModalJobStatus) {
        let patch = serde_json::json!({ "status": status });
        if let Err(e) = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            error!(error = %e, "Failed to update ModalJob status");
            self.metrics
                .record_error("status_update_failed", "kubernetes_api");
        }
    }

    /// Watch the remote app until it finishes and reflect the terminal
    /// state onto the resource.
    fn spawn_monitor(
        &self,
        namespace: String,
        name: String,
        app_id: String,
        gpu_type: Option<String>,
    ) {
        let client = self.client.clone();
        let modal = Arc::clone(&self.modal);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let api: Api<ModalJob> = Api::namespaced(client, &namespace);
            let started = std::time::Instant::now();
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = match modal.app_status(&app_id).await {
                    Ok(status) => status,
                    Err(e) if e.is_not_found() => {
                        debug!(%app_id, "Remote app gone, stopping monitor");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to poll remote app status");
                        continue;
                    }
                };

                // Each poll refreshes the utilization and running-cost
                // gauges for GPU jobs.
                if let Some(gpu) = gpu_type.as_deref() {
                    if let Some(utilization) = status.gpu_utilization {
                        metrics.update_gpu_utilization(&name, gpu, utilization);
                    }
                    let hours = started.elapsed().as_secs_f64() / 3600.0;
                    metrics.update_cost_estimate(&name, gpu, "total", gpu_hourly_rate(gpu) * hours);
                }

                if !status.state.is_terminal() {
                    continue;
                }
                if let Some(gpu) = gpu_type.as_deref() {
                    metrics.update_gpu_utilization(&name, gpu, 0.0);
                }

                let (phase, condition, metric_status) = match status.state {
                    modal_client::AppState::Succeeded => (
                        JobPhase::Succeeded,
                        Condition::ready("JobSucceeded", "Modal job completed successfully"),
                        "completed",
                    ),
                    modal_client::AppState::Stopped => {
                        debug!(%app_id, "Remote app stopped, leaving status as is");
                        return;
                    }
                    _ => (
                        JobPhase::Failed,
                        Condition::not_ready(
                            "JobFailed",
                            status
                                .message
                                .as_deref()
                                .unwrap_or("Modal job failed remotely"),
                        ),
                        "failed",
                    ),
                };
                metrics.record_job_completed(&name, metric_status, gpu_type.as_deref());

                let patch = serde_json::json!({
                    "status": {
                        "phase": phase,
                        "finishedAt": crate::crd::now_rfc3339(),
                        "conditions": [condition],
                    }
                });
                if let Err(e) = api
                    .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    warn!(error = %e, "Failed to record terminal job state");
                }
                return;
            }
        });
    }

    async fn teardown(&self, job: &ModalJob) {
        let name = job.name();
        let status = match &job.status {
            Some(status) => status,
            None => return,
        };
        if let Some(app_id) = &status.remote_app_id {
            let function_id = status.remote_function_id.as_deref().unwrap_or_default();
            match self.modal.cancel_job(app_id, function_id).await {
                Ok(()) => info!(%app_id, "Cancelled remote job"),
                Err(e) if e.is_not_found() => debug!(%app_id, "Remote job already gone"),
                Err(e) => warn!(error = %e, %app_id, "Failed to cancel remote job"),
            }
            self.metrics
                .record_job_completed(&name, "completed", gpu_type_of(job).as_deref());
        }
    }
}

#[async_trait]
impl EventHandler<ModalJob> for JobController {
    async fn applied(&self, job: ModalJob, deleted: watch::Receiver<bool>) {
        let name = job.name();
        if let Err(e) = self.reconcile(job, deleted).await {
            error!(error = %e, %name, "ModalJob reconcile failed");
            self.metrics.record_error("reconcile_failed", "job_controller");
        }
    }

    async fn deleted(&self, job: ModalJob) {
        // Normally the finalizer path has already stopped the remote app;
        // this covers force-deletes where the watch skips straight here.
        self.teardown(&job).await;
    }
}

fn gpu_type_of(job: &ModalJob) -> Option<String> {
    job.spec
        .gpu
        .as_deref()
        .map(|gpu| gpu.split(':').next().unwrap_or(gpu).to_owned())
}

/// Backend list price per GPU hour, used for the cost-estimate gauge.
fn gpu_hourly_rate(gpu_type: &str) -> f64 {
    match gpu_type {
        "T4" => 0.59,
        "L4" => 0.80,
        "A10G" => 1.10,
        "A100" => 2.78,
        "H100" => 4.56,
        _ => 1.00,
    }
}

/// Translate a job resource into a backend submission.
fn build_request(job: &ModalJob) -> Result<JobRequest, TranslationError> {
    let spec = &job.spec;
    if spec.replicas > 1 && !spec.enable_cluster_networking {
        return Err(TranslationError {
            field: "replicas",
            message: "replicas > 1 requires enableClusterNetworking".to_owned(),
        });
    }

    let cpu = parse_cpu(&spec.cpu)?;
    let memory_mib = parse_memory_mib(&spec.memory)?;
    let gpu = spec
        .gpu
        .as_deref()
        .map(parse_gpu)
        .transpose()?
        .map(|g| g.to_string());

    let mut env = spec.env.clone();
    if spec.tunnel {
        env.insert("TUNNEL_ENABLED".to_owned(), "true".to_owned());
        env.insert("TUNNEL_PORT".to_owned(), spec.tunnel_port.to_string());
    }

    Ok(JobRequest {
        name: job.name(),
        image: spec.image.clone(),
        cpu,
        memory_mib,
        gpu,
        timeout_seconds: spec.timeout_seconds,
        retries: spec.retries,
        cluster_networking: spec.enable_cluster_networking || spec.replicas > 1,
        tasks: expand_replicas(&spec.command, &spec.args, &env, spec.replicas),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::ModalJobSpec;
    use kube::api::ObjectMeta;

    fn job(spec: ModalJobSpec) -> ModalJob {
        let mut job = ModalJob::new("train", spec);
        job.metadata = ObjectMeta {
            name: Some("train".to_owned()),
            namespace: Some("default".to_owned()),
            ..Default::default()
        };
        job
    }

    #[test]
    fn translates_a_minimal_gpu_job() {
        let request = build_request(&job(ModalJobSpec {
            image: "nvidia/cuda:11.8-runtime-ubuntu20.04".to_owned(),
            command: vec!["nvidia-smi".to_owned()],
            cpu: "250m".to_owned(),
            memory: "2Gi".to_owned(),
            gpu: Some("T4".to_owned()),
            ..Default::default()
        }))
        .expect("request builds");

        assert_eq!(request.image, "nvidia/cuda:11.8-runtime-ubuntu20.04");
        assert_eq!(request.cpu, "0.25");
        assert_eq!(request.memory_mib, 2048);
        assert_eq!(request.gpu.as_deref(), Some("T4:1"));
        assert_eq!(request.tasks.len(), 1);
        assert_eq!(request.tasks[0].command, ["nvidia-smi"]);
    }

    #[test]
    fn tunnel_env_is_injected() {
        let request = build_request(&job(ModalJobSpec {
            image: "python:3.11-slim".to_owned(),
            tunnel: true,
            tunnel_port: 9000,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(request.tasks[0].env["TUNNEL_ENABLED"], "true");
        assert_eq!(request.tasks[0].env["TUNNEL_PORT"], "9000");
    }

    #[test]
    fn distributed_jobs_expand_ranks() {
        let request = build_request(&job(ModalJobSpec {
            image: "pytorch/pytorch:latest".to_owned(),
            command: vec![
                "python".to_owned(),
                "-m".to_owned(),
                "torch.distributed.launch".to_owned(),
                "train.py".to_owned(),
            ],
            replicas: 3,
            enable_cluster_networking: true,
            ..Default::default()
        }))
        .unwrap();

        assert!(request.cluster_networking);
        assert_eq!(request.tasks.len(), 3);
        for (rank, task) in request.tasks.iter().enumerate() {
            assert_eq!(task.env["RANK"], rank.to_string());
            assert_eq!(task.env["WORLD_SIZE"], "3");
        }
    }

    #[test]
    fn replicas_without_networking_fail_translation() {
        let err = build_request(&job(ModalJobSpec {
            image: "pytorch/pytorch:latest".to_owned(),
            replicas: 3,
            ..Default::default()
        }))
        .unwrap_err();
        assert_eq!(err.field, "replicas");
        assert_eq!(err.reason(), "TranslationFailed_replicas");
    }

    #[test]
    fn bad_memory_is_a_translation_error() {
        let err = build_request(&job(ModalJobSpec {
            image: "python:3.11-slim".to_owned(),
            memory: "plenty".to_owned(),
            ..Default::default()
        }))
        .unwrap_err();
        assert_eq!(err.reason(), "TranslationFailed_memory");
    }

    #[test]
    fn gpu_rates_scale_with_hardware() {
        assert!(gpu_hourly_rate("T4") < gpu_hourly_rate("A100"));
        assert!(gpu_hourly_rate("A100") < gpu_hourly_rate("H100"));
        assert!(gpu_hourly_rate("unknown") > 0.0);
    }

    #[test]
    fn gpu_type_extraction() {
        let with_gpu = job(ModalJobSpec {
            image: "x".to_owned(),
            gpu: Some("A100:2".to_owned()),
            ..Default::default()
        });
        assert_eq!(gpu_type_of(&with_gpu).as_deref(), Some("A100"));
        let without = job(ModalJobSpec {
            image: "x".to_owned(),
            ..Default::default()
        });
        assert_eq!(gpu_type_of(&without), None);
    }
}
