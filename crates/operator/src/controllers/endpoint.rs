//! Reconciler for `ModalEndpoint`
//!
//! Deploys a persistent HTTP service on the backend. Before deploying it
//! scans the backend's deployed apps and stops any prior deployment that
//! still holds this endpoint's name, so a recreated resource never leaks
//! an orphan. The deployment survives reconciler restarts; only resource
//! deletion stops it.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use modal_client::{BackendError, EndpointRequest, ModalApi};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{
    call_backend, delete_service, ensure_external_name_service, ensure_finalizer,
    remove_finalizer, run_controller, unless_deleted, EventHandler, DEPLOY_TIMEOUT,
};
use crate::crd::{Condition, EndpointPhase, ModalEndpoint, ModalEndpointStatus};
use crate::metrics::Metrics;
use crate::translate::{parse_cpu, parse_gpu, parse_memory_mib, TranslationError};

/// Drives `ModalEndpoint` resources against the backend.
pub struct EndpointController {
    client: kube::Client,
    modal: Arc<dyn ModalApi>,
    metrics: Arc<Metrics>,
}

impl EndpointController {
    /// Create the controller.
    pub fn new(client: kube::Client, modal: Arc<dyn ModalApi>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(EndpointController {
            client,
            modal,
            metrics,
        })
    }

    /// Watch `ModalEndpoint` resources until the stream ends.
    pub async fn run(self: Arc<Self>) {
        let api: Api<ModalEndpoint> = Api::all(self.client.clone());
        info!("Starting ModalEndpoint controller");
        run_controller(api, self as Arc<dyn EventHandler<ModalEndpoint>>).await;
    }

    #[instrument(level = "info", skip(self, endpoint, deleted), fields(name = %endpoint.name(), namespace = ?endpoint.namespace()))]
    async fn reconcile(
        &self,
        endpoint: ModalEndpoint,
        deleted: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let name = endpoint.name();
        let namespace = endpoint.namespace().unwrap_or_else(|| "default".to_owned());
        let api: Api<ModalEndpoint> = Api::namespaced(self.client.clone(), &namespace);

        if endpoint.metadata.deletion_timestamp.is_some() {
            self.teardown(&endpoint, &namespace).await;
            remove_finalizer(&api, &endpoint).await?;
            return Ok(());
        }

        if endpoint
            .status
            .as_ref()
            .and_then(|s| s.remote_app_id.as_ref())
            .is_some()
        {
            debug!("Endpoint already deployed, nothing to do");
            return Ok(());
        }

        ensure_finalizer(&api, &endpoint).await?;

        let request = match build_request(&endpoint) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Endpoint spec failed translation");
                self.metrics
                    .record_error(&e.reason(), "endpoint_controller");
                self.fail(&api, &name, &e.reason(), &e.to_string()).await;
                return Ok(());
            }
        };

        self.stop_orphans(&request.name).await;

        let deployed = match unless_deleted(
            deleted,
            tokio::time::timeout(
                DEPLOY_TIMEOUT,
                call_backend(|| self.modal.create_endpoint(&request)),
            ),
        )
        .await
        {
            None => {
                debug!("Endpoint deleted while deployment was in flight");
                return Ok(());
            }
            Some(Err(_)) => {
                self.metrics.record_error("timeout", "endpoint_controller");
                self.fail(&api, &name, "BackendUnavailable", "deployment timed out")
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
            Some(Ok(Ok(deployed))) => deployed,
        };

        info!(app_id = %deployed.app_id, url = %deployed.endpoint_url, "Modal endpoint deployed");

        if let Err(e) = ensure_external_name_service(
            self.client.clone(),
            &namespace,
            &name,
            &deployed.endpoint_url,
        )
        .await
        {
            warn!(error = %e, "Failed to create endpoint Service");
            self.metrics
                .record_error("service_create_failed", "kubernetes_api");
        }

        self.patch_status(
            &api,
            &name,
            ModalEndpointStatus {
                phase: EndpointPhase::Ready,
                remote_app_id: Some(deployed.app_id),
                endpoint_url: Some(deployed.endpoint_url.clone()),
                ready_replicas: 1,
                conditions: vec![Condition::ready(
                    "EndpointReady",
                    &format!("Modal endpoint is ready at {}", deployed.endpoint_url),
                )],
            },
        )
        .await;
        Ok(())
    }

    /// Stop any prior deployment still holding this endpoint's name.
    async fn stop_orphans(&self, deployment_name: &str) {
        let deployment = format!("{}-endpoint", deployment_name);
        let apps = match self.modal.list_deployed_apps().await {
            Ok(apps) => apps,
            Err(e) => {
                // Nothing deployed yet is the common case for a first
                // deployment; a listing failure only skips the scan.
                debug!(error = %e, "Could not list deployed apps for orphan scan");
                return;
            }
        };
        for app in apps.into_iter().filter(|app| app.name == deployment) {
            info!(app_id = %app.app_id, name = %app.name, "Stopping orphaned deployment");
            match self.modal.delete_app(&app.app_id).await {
                Ok(()) => (),
                Err(e) if e.is_not_found() => (),
                Err(e) => warn!(error = %e, app_id = %app.app_id, "Failed to stop orphan"),
            }
        }
    }

    async fn fail(&self, api: &Api<ModalEndpoint>, name: &str, reason: &str, message: &str) {
        error!(%reason, %message, "Endpoint deployment failed");
        self.patch_status(
            api,
            name,
            ModalEndpointStatus {
                phase: EndpointPhase::Failed,
                conditions: vec![Condition::not_ready(reason, message)],
                ..Default::default()
            },
        )
        .await;
    }

    async fn patch_status(&self, api: &Api<ModalEndpoint>, name: &str, status: ModalEndpointStatus) {
        let patch = serde_json::json!({ "status": status });
        if let Err(e) = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            error!(error = %e, "Failed to update ModalEndpoint status");
            self.metrics
                .record_error("status_update_failed", "kubernetes_api");
        }
    }

    async fn teardown(&self, endpoint: &ModalEndpoint, namespace: &str) {
        let name = endpoint.name();
        if let Some(app_id) = endpoint
            .status
            .as_ref()
            .and_then(|s| s.remote_app_id.as_ref())
        {
            match self.modal.delete_app(app_id).await {
                Ok(()) => info!(%app_id, "Stopped remote endpoint app"),
                Err(e) if e.is_not_found() => debug!(%app_id, "Remote endpoint already gone"),
                Err(e) => warn!(error = %e, %app_id, "Failed to stop remote endpoint"),
            }
        }
        if let Err(e) = delete_service(self.client.clone(), namespace, &name).await {
            warn!(error = %e, "Failed to delete endpoint Service");
        }
    }
}

#[async_trait]
impl EventHandler<ModalEndpoint> for EndpointController {
    async fn applied(&self, endpoint: ModalEndpoint, deleted: watch::Receiver<bool>) {
        let name = endpoint.name();
        if let Err(e) = self.reconcile(endpoint, deleted).await {
            error!(error = %e, %name, "ModalEndpoint reconcile failed");
            self.metrics
                .record_error("reconcile_failed", "endpoint_controller");
        }
    }

    async fn deleted(&self, endpoint: ModalEndpoint) {
        let namespace = endpoint.namespace().unwrap_or_else(|| "default".to_owned());
        self.teardown(&endpoint, &namespace).await;
    }
}

fn build_request(endpoint: &ModalEndpoint) -> Result<EndpointRequest, TranslationError> {
    let spec = &endpoint.spec;
    if spec.max_replicas < spec.min_replicas {
        return Err(TranslationError {
            field: "maxReplicas",
            message: format!(
                "maxReplicas ({}) must not be below minReplicas ({})",
                spec.max_replicas, spec.min_replicas
            ),
        });
    }
    Ok(EndpointRequest {
        name: endpoint.name(),
        image: spec.image.clone(),
        handler: spec.handler.clone(),
        command: spec.command.clone(),
        args: spec.args.clone(),
        cpu: parse_cpu(&spec.cpu)?,
        memory_mib: parse_memory_mib(&spec.memory)?,
        gpu: spec
            .gpu
            .as_deref()
            .map(parse_gpu)
            .transpose()?
            .map(|g| g.to_string()),
        env: spec.env.clone(),
        min_replicas: spec.min_replicas,
        max_replicas: spec.max_replicas,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::ModalEndpointSpec;
    use kube::api::ObjectMeta;

    fn endpoint(spec: ModalEndpointSpec) -> ModalEndpoint {
        let mut endpoint = ModalEndpoint::new("serve", spec);
        endpoint.metadata = ObjectMeta {
            name: Some("serve".to_owned()),
            namespace: Some("default".to_owned()),
            ..Default::default()
        };
        endpoint
    }

    #[test]
    fn translates_command_wrapped_endpoints() {
        let request = build_request(&endpoint(ModalEndpointSpec {
            image: "tensorflow/serving:latest".to_owned(),
            handler: "serve.predict".to_owned(),
            command: vec!["tensorflow_model_server".to_owned()],
            args: vec!["--rest_api_port=8501".to_owned()],
            gpu: Some("T4:1".to_owned()),
            ..Default::default()
        }))
        .expect("request builds");

        assert_eq!(request.command, ["tensorflow_model_server"]);
        assert_eq!(request.gpu.as_deref(), Some("T4:1"));
        assert_eq!(request.handler, "serve.predict");
    }

    #[test]
    fn replica_bounds_are_validated() {
        let err = build_request(&endpoint(ModalEndpointSpec {
            image: "tensorflow/serving:latest".to_owned(),
            min_replicas: 5,
            max_replicas: 2,
            ..Default::default()
        }))
        .unwrap_err();
        assert_eq!(err.reason(), "TranslationFailed_maxReplicas");
    }
}
