//! Reconciler for `ModalFunction`
//!
//! Deploys the handler on the backend, records the invocation URL, and
//! publishes an `ExternalName` Service so in-cluster clients resolve the
//! function host through normal DNS.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use modal_client::{BackendError, FunctionRequest, ModalApi};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{
    call_backend, delete_service, ensure_external_name_service, ensure_finalizer,
    remove_finalizer, run_controller, unless_deleted, EventHandler, DEPLOY_TIMEOUT,
};
use crate::crd::{Condition, FunctionPhase, ModalFunction, ModalFunctionStatus};
use crate::metrics::Metrics;
use crate::translate::{parse_cpu, parse_gpu, parse_memory_mib, TranslationError};

/// Drives `ModalFunction` resources against the backend.
pub struct FunctionController {
    client: kube::Client,
    modal: Arc<dyn ModalApi>,
    metrics: Arc<Metrics>,
}

impl FunctionController {
    /// Create the controller.
    pub fn new(client: kube::Client, modal: Arc<dyn ModalApi>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(FunctionController {
            client,
            modal,
            metrics,
        })
    }

    /// Watch `ModalFunction` resources until the stream ends.
    pub async fn run(self: Arc<Self>) {
        let api: Api<ModalFunction> = Api::all(self.client.clone());
        info!("Starting ModalFunction controller");
        run_controller(api, self as Arc<dyn EventHandler<ModalFunction>>).await;
    }

    #[instrument(level = "info", skip(self, function, deleted), fields(name = %function.name(), namespace = ?function.namespace()))]
    async fn reconcile(
        &self,
        function: ModalFunction,
        deleted: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let name = function.name();
        let namespace = function.namespace().unwrap_or_else(|| "default".to_owned());
        let api: Api<ModalFunction> = Api::namespaced(self.client.clone(), &namespace);

        if function.metadata.deletion_timestamp.is_some() {
            self.teardown(&function, &namespace).await;
            remove_finalizer(&api, &function).await?;
            return Ok(());
        }

        if function
            .status
            .as_ref()
            .and_then(|s| s.remote_app_id.as_ref())
            .is_some()
        {
            debug!("Function already deployed, nothing to do");
            return Ok(());
        }

        ensure_finalizer(&api, &function).await?;

        let request = match build_request(&function) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Function spec failed translation");
                self.metrics
                    .record_error(&e.reason(), "function_controller");
                self.patch_status(
                    &api,
                    &name,
                    ModalFunctionStatus {
                        phase: FunctionPhase::Failed,
                        message: Some(e.to_string()),
                        conditions: vec![Condition::not_ready(&e.reason(), &e.to_string())],
                        ..Default::default()
                    },
                )
                .await;
                return Ok(());
            }
        };

        let deployed = match unless_deleted(
            deleted,
            tokio::time::timeout(
                DEPLOY_TIMEOUT,
                call_backend(|| self.modal.create_function(&request)),
            ),
        )
        .await
        {
            None => {
                debug!("Function deleted while deployment was in flight");
                return Ok(());
            }
            Some(Err(_)) => {
                self.metrics.record_error("timeout", "function_controller");
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

        info!(app_id = %deployed.app_id, url = %deployed.function_url, "Modal function deployed");

        if let Err(e) = ensure_external_name_service(
            self.client.clone(),
            &namespace,
            &name,
            &deployed.function_url,
        )
        .await
        {
            // The function itself is up; a missing Service only affects
            // in-cluster DNS resolution.
            warn!(error = %e, "Failed to create function Service");
            self.metrics
                .record_error("service_create_failed", "kubernetes_api");
        }

        self.patch_status(
            &api,
            &name,
            ModalFunctionStatus {
                phase: FunctionPhase::Deployed,
                remote_app_id: Some(deployed.app_id),
                function_url: Some(deployed.function_url.clone()),
                message: Some("Function deployed successfully".to_owned()),
                conditions: vec![Condition::ready(
                    "FunctionDeployed",
                    &format!("Modal function is callable at {}", deployed.function_url),
                )],
            },
        )
        .await;
        Ok(())
    }

    async fn fail(&self, api: &Api<ModalFunction>, name: &str, reason: &str, message: &str) {
        error!(%reason, %message, "Function deployment failed");
        self.patch_status(
            api,
            name,
            ModalFunctionStatus {
                phase: FunctionPhase::Failed,
                message: Some(message.to_owned()),
                conditions: vec![Condition::not_ready(reason, message)],
                ..Default::default()
            },
        )
        .await;
    }

    async fn patch_status(&self, api: &Api<ModalFunction>, name: &str, status: ModalFunctionStatus) {
        let patch = serde_json::json!({ "status": status });
        if let Err(e) = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            error!(error = %e, "Failed to update ModalFunction status");
            self.metrics
                .record_error("status_update_failed", "kubernetes_api");
        }
    }

    async fn teardown(&self, function: &ModalFunction, namespace: &str) {
        let name = function.name();
        if let Some(app_id) = function
            .status
            .as_ref()
            .and_then(|s| s.remote_app_id.as_ref())
        {
            match self.modal.delete_app(app_id).await {
                Ok(()) => info!(%app_id, "Deleted remote function app"),
                Err(e) if e.is_not_found() => debug!(%app_id, "Remote function already gone"),
                Err(e) => warn!(error = %e, %app_id, "Failed to delete remote function"),
            }
        }
        if let Err(e) = delete_service(self.client.clone(), namespace, &name).await {
            warn!(error = %e, "Failed to delete function Service");
        }
    }
}

#[async_trait]
impl EventHandler<ModalFunction> for FunctionController {
    async fn applied(&self, function: ModalFunction, deleted: watch::Receiver<bool>) {
        let name = function.name();
        if let Err(e) = self.reconcile(function, deleted).await {
            error!(error = %e, %name, "ModalFunction reconcile failed");
            self.metrics
                .record_error("reconcile_failed", "function_controller");
        }
    }

    async fn deleted(&self, function: ModalFunction) {
        let namespace = function.namespace().unwrap_or_else(|| "default".to_owned());
        self.teardown(&function, &namespace).await;
    }
}

fn build_request(function: &ModalFunction) -> Result<FunctionRequest, TranslationError> {
    let spec = &function.spec;
    Ok(FunctionRequest {
        name: function.name(),
        image: spec.image.clone(),
        handler: spec.handler.clone(),
        cpu: parse_cpu(&spec.cpu)?,
        memory_mib: parse_memory_mib(&spec.memory)?,
        gpu: spec
            .gpu
            .as_deref()
            .map(parse_gpu)
            .transpose()?
            .map(|g| g.to_string()),
        env: spec.env.clone(),
        timeout_seconds: spec.timeout_seconds,
        concurrency: spec.concurrency.max(1),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::ModalFunctionSpec;
    use kube::api::ObjectMeta;

    fn function(spec: ModalFunctionSpec) -> ModalFunction {
        let mut function = ModalFunction::new("embed", spec);
        function.metadata = ObjectMeta {
            name: Some("embed".to_owned()),
            namespace: Some("default".to_owned()),
            ..Default::default()
        };
        function
    }

    #[test]
    fn translates_handler_and_resources() {
        let request = build_request(&function(ModalFunctionSpec {
            image: "python:3.11-slim".to_owned(),
            handler: "app.process_image".to_owned(),
            cpu: "500m".to_owned(),
            memory: "1Gi".to_owned(),
            concurrency: 4,
            ..Default::default()
        }))
        .expect("request builds");

        assert_eq!(request.handler, "app.process_image");
        assert_eq!(request.cpu, "0.5");
        assert_eq!(request.memory_mib, 1024);
        assert_eq!(request.concurrency, 4);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let request = build_request(&function(ModalFunctionSpec {
            image: "python:3.11-slim".to_owned(),
            concurrency: 0,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(request.concurrency, 1);
    }

    #[test]
    fn gpu_errors_name_the_field() {
        let err = build_request(&function(ModalFunctionSpec {
            image: "python:3.11-slim".to_owned(),
            gpu: Some("T4:zero".to_owned()),
            ..Default::default()
        }))
        .unwrap_err();
        assert_eq!(err.reason(), "TranslationFailed_gpu");
    }
}
