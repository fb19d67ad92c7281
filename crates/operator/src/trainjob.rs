//! Kubeflow TrainJob ingestion
//!
//! Watches Kubeflow Trainer v2 resources and converts the ones addressed
//! to this operator into `ModalJob` submissions, the same way the pod
//! interception path converts pods. The operator does not own the
//! TrainJob CRD; the types here are a consuming view of the fields it
//! reads. The derived job is owned by the TrainJob, so deleting the
//! TrainJob cascades into the job reconciler's remote teardown.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, CustomResource, ResourceExt};
use kube_runtime::watcher::{self, Event};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations;
use crate::controllers::{is_conflict, is_not_found};
use crate::crd::{ModalJob, ModalJobSpec};
use crate::metrics::Metrics;
use crate::translate::GPU_RESOURCE;

/// Annotation that opts a TrainJob into Modal execution.
const MODAL_ENABLED_ANNOTATION: &str = "modal.com/enabled";
/// Trainer env variable that opts a TrainJob into Modal execution.
const MODAL_ENABLED_ENV: &str = "MODAL_ENABLED";
/// Runtime name prefix that opts a TrainJob into Modal execution.
const MODAL_RUNTIME_PREFIX: &str = "modal-";

/// The fragment of a Kubeflow `TrainJob` this operator reads.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "trainer.kubeflow.org",
    version = "v1alpha1",
    kind = "TrainJob",
    derive = "Default",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrainJobSpec {
    /// The training runtime this job refers to
    #[serde(default)]
    pub runtime_ref: RuntimeRef,
    /// Trainer entrypoint configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trainer: Option<TrainerSpec>,
    /// Per-replica pod overrides
    #[serde(default)]
    pub pod_spec_overrides: Vec<PodSpecOverride>,
}

/// Reference to a Kubeflow training runtime.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct RuntimeRef {
    /// Runtime name; `modal-` prefixed runtimes are handled here
    #[serde(default)]
    pub name: String,
}

/// Trainer entrypoint configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TrainerSpec {
    /// Entrypoint command
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the trainer
    #[serde(default)]
    pub env: Vec<TrainerEnv>,
}

/// One trainer environment variable.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TrainerEnv {
    /// Variable name
    pub name: String,
    /// Literal value; valueFrom references are not resolved here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A pod override applied to a subset of the derived jobs.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpecOverride {
    /// Jobs this override targets, one per replica
    #[serde(default)]
    pub target_jobs: Vec<TargetJob>,
    /// Container overrides carrying resource requests
    #[serde(default)]
    pub containers: Vec<OverrideContainer>,
}

/// A targeted job within a pod override.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TargetJob {
    /// Target job name
    #[serde(default)]
    pub name: String,
}

/// A container override; only resource requests are consulted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct OverrideContainer {
    /// Container name
    #[serde(default)]
    pub name: String,
    /// Resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<OverrideResources>,
}

/// Resource requirements of an override container.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct OverrideResources {
    /// Requested resources by name
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

/// Watches Kubeflow TrainJobs and materializes `ModalJob` siblings.
pub struct TrainJobWatcher {
    client: kube::Client,
    metrics: Arc<Metrics>,
}

impl TrainJobWatcher {
    /// Create the watcher.
    pub fn new(client: kube::Client, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(TrainJobWatcher { client, metrics })
    }

    /// Watch TrainJobs until the stream ends.
    pub async fn run(self: Arc<Self>) {
        let api: Api<TrainJob> = Api::all(self.client.clone());
        info!("Starting TrainJob watcher");
        let mut stream = watcher::watcher(api, ListParams::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(trainjob)) => self.spawn_handle(trainjob),
                Ok(Event::Restarted(trainjobs)) => {
                    for trainjob in trainjobs {
                        self.spawn_handle(trainjob);
                    }
                }
                // The derived ModalJob is owned by the TrainJob and is
                // garbage-collected with it; the job reconciler's
                // finalizer stops the remote app.
                Ok(Event::Deleted(trainjob)) => {
                    debug!(name = %trainjob.name(), "TrainJob deleted, cleanup cascades");
                }
                Err(e) => {
                    warn!(error = %e, "TrainJob watch error (is the Kubeflow Trainer CRD installed?)")
                }
            }
        }
    }

    fn spawn_handle(self: &Arc<Self>, trainjob: TrainJob) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let name = trainjob.name();
            if let Err(e) = this.handle(trainjob).await {
                error!(error = %e, trainjob = %name, "Failed to process TrainJob");
                this.metrics
                    .record_error("trainjob_event_failed", "trainjob_watcher");
            }
        });
    }

    #[instrument(level = "debug", skip(self, trainjob), fields(name = %trainjob.name(), namespace = ?trainjob.namespace()))]
    async fn handle(&self, trainjob: TrainJob) -> anyhow::Result<()> {
        if trainjob.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        if trainjob.spec.runtime_ref.name.is_empty() {
            warn!("TrainJob must specify runtimeRef.name, skipping");
            return Ok(());
        }
        if !should_handle(&trainjob) {
            debug!("TrainJob not configured for Modal, skipping");
            return Ok(());
        }

        let name = trainjob.name();
        let namespace = trainjob.namespace().unwrap_or_else(|| "default".to_owned());
        let job_name = format!("trainjob-{}", name);

        let api: Api<ModalJob> = Api::namespaced(self.client.clone(), &namespace);
        match api.get(&job_name).await {
            Ok(_) => {
                debug!(%job_name, "ModalJob already exists for TrainJob");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => (),
            Err(e) => {
                warn!(error = %e, %job_name, "ModalJob lookup failed, attempting create");
            }
        }

        let mut job = ModalJob::new(&job_name, modal_job_spec(&trainjob));
        job.metadata = ObjectMeta {
            name: Some(job_name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(
                [(annotations::ORIGINAL_POD.to_owned(), name.clone())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: owner_reference(&trainjob).map(|o| vec![o]),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &job).await {
            Ok(_) => info!(%job_name, "Created ModalJob for TrainJob"),
            Err(e) if is_conflict(&e) => {
                debug!(%job_name, "ModalJob created concurrently");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // Best effort; older Trainer CRDs ship without a status
        // subresource.
        let trainjobs: Api<TrainJob> = Api::namespaced(self.client.clone(), &namespace);
        let status = serde_json::json!({
            "status": { "modalJobName": job_name, "status": "Created" }
        });
        if let Err(e) = trainjobs
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await
        {
            debug!(error = %e, "Could not record ModalJob name on TrainJob status");
        }
        Ok(())
    }
}

/// Whether a TrainJob is addressed to this operator.
fn should_handle(trainjob: &TrainJob) -> bool {
    if trainjob
        .spec
        .runtime_ref
        .name
        .starts_with(MODAL_RUNTIME_PREFIX)
    {
        return true;
    }
    if trainjob
        .spec
        .trainer
        .iter()
        .flat_map(|t| t.env.iter())
        .any(|var| var.name == MODAL_ENABLED_ENV)
    {
        return true;
    }
    trainjob
        .annotations()
        .get(MODAL_ENABLED_ANNOTATION)
        .map(String::as_str)
        == Some("true")
}

/// Convert a TrainJob into the spec of its derived `ModalJob`.
fn modal_job_spec(trainjob: &TrainJob) -> ModalJobSpec {
    let trainer = trainjob.spec.trainer.clone().unwrap_or_default();
    let command = if trainer.command.is_empty() {
        vec!["python".to_owned()]
    } else {
        trainer.command
    };
    let env: BTreeMap<String, String> = trainer
        .env
        .into_iter()
        .filter_map(|var| var.value.map(|value| (var.name, value)))
        .collect();

    // One replica per targeted job; overrides may address disjoint sets,
    // so the widest one wins.
    let replicas = trainjob
        .spec
        .pod_spec_overrides
        .iter()
        .map(|o| o.target_jobs.len() as u32)
        .max()
        .unwrap_or(1)
        .max(1);

    let wants_gpu = trainjob
        .spec
        .pod_spec_overrides
        .iter()
        .flat_map(|o| o.containers.iter())
        .any(|container| {
            container
                .resources
                .as_ref()
                .map(|r| r.requests.contains_key(GPU_RESOURCE))
                .unwrap_or(false)
        });

    ModalJobSpec {
        image: trainjob
            .annotations()
            .get(annotations::IMAGE)
            .cloned()
            .unwrap_or_else(|| "python:3.11-slim".to_owned()),
        command,
        args: trainer.args,
        cpu: "2.0".to_owned(),
        memory: "4Gi".to_owned(),
        gpu: wants_gpu.then(|| "T4:1".to_owned()),
        env,
        timeout_seconds: 3600,
        replicas,
        enable_cluster_networking: replicas > 1,
        ..Default::default()
    }
}

fn owner_reference(trainjob: &TrainJob) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "trainer.kubeflow.org/v1alpha1".to_owned(),
        kind: "TrainJob".to_owned(),
        name: trainjob.metadata.name.clone()?,
        uid: trainjob.metadata.uid.clone()?,
        controller: Some(true),
        ..Default::default()
    })
}
