//! Custom-resource reconcilers
//!
//! All three follow the same control pattern: on create, translate the
//! spec, call the backend, patch status; on delete, stop the remote
//! resource and release the finalizer. Failures patch a `Ready=False`
//! condition whose reason names the failing component and do not requeue;
//! users delete and recreate.

mod endpoint;
mod function;
mod job;
mod queue;

pub use endpoint::EndpointController;
pub use function::FunctionController;
pub use job::JobController;
pub(crate) use queue::{run_controller, unless_deleted, EventHandler};

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::error::ErrorResponse;
use kube::{Api, Resource, ResourceExt};
use modal_client::BackendError;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::annotations;

/// Fixed reconcile timeout for Function and Endpoint deployments.
pub(crate) const DEPLOY_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded retry budget for retryable backend failures within one
/// reconcile pass.
const BACKEND_ATTEMPTS: u32 = 3;

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { code: 404, .. }))
}

pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { code: 409, .. }))
}

/// Call the backend with a small exponential backoff around retryable
/// failures.
pub(crate) async fn call_backend<T, F, Fut>(mut call: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < BACKEND_ATTEMPTS => {
                warn!(error = %e, attempt, "Backend call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Add the operator finalizer to an object if it is not already present.
pub(crate) async fn ensure_finalizer<K>(api: &Api<K>, obj: &K) -> kube::Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == annotations::FINALIZER) {
        return Ok(());
    }
    finalizers.push(annotations::FINALIZER.to_owned());
    api.patch(
        &obj.name(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

/// Drop the operator finalizer, letting the API server finish the delete.
pub(crate) async fn remove_finalizer<K>(api: &Api<K>, obj: &K) -> kube::Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != annotations::FINALIZER)
        .collect();
    match api
        .patch(
            &obj.name(),
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create an `ExternalName` Service resolving to the host of the given
/// URL, so in-cluster clients can reach the remote deployment through
/// ordinary DNS. An existing Service with the same name is left alone.
pub(crate) async fn ensure_external_name_service(
    client: kube::Client,
    namespace: &str,
    name: &str,
    url: &str,
) -> anyhow::Result<()> {
    let host = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_owned();
    if host.is_empty() {
        anyhow::bail!("no host in url {:?}", url);
    }

    let mut labels = BTreeMap::new();
    labels.insert(annotations::FUNCTION.to_owned(), name.to_owned());
    labels.insert(annotations::MANAGED.to_owned(), "true".to_owned());
    let mut svc_annotations = BTreeMap::new();
    svc_annotations.insert(annotations::FUNCTION_URL.to_owned(), url.to_owned());

    let service = Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels),
            annotations: Some(svc_annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_owned()),
            external_name: Some(host.clone()),
            ports: Some(vec![ServicePort {
                port: 443,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let api: Api<Service> = Api::namespaced(client, namespace);
    match api.create(&PostParams::default(), &service).await {
        Ok(_) => {
            debug!(%name, %host, "Created ExternalName service");
            Ok(())
        }
        Err(e) if is_conflict(&e) => {
            debug!(%name, "ExternalName service already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete a Service, tolerating its absence.
pub(crate) async fn delete_service(
    client: kube::Client,
    namespace: &str,
    name: &str,
) -> anyhow::Result<()> {
    let api: Api<Service> = Api::namespaced(client, namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => {
            debug!(%name, "Service already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
