//! Pod interception
//!
//! Watches pods cluster-wide. Pods the webhook mutated get their sibling
//! custom resource (named `<pod>-modal`, owned by the pod so deletion
//! cascades) plus a tunnel Service, and an immediate status sync. Pods
//! that request a GPU or carry an offload annotation but were *not*
//! mutated go down the legacy path and get a `ModalJob` built from their
//! live spec. The legacy path never touches mutated pods, so a workload
//! is submitted exactly once.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, ObjectMeta, PostParams};
use kube::{Api, ResourceExt};
use kube_runtime::watcher::{self, Event};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations;
use crate::capsule::Capsule;
use crate::classify::{classify, resource_kind, ResourceKind, WorkloadType};
use crate::controllers::{is_conflict, is_not_found};
use crate::crd::{
    ModalEndpoint, ModalEndpointSpec, ModalFunction, ModalFunctionSpec, ModalJob, ModalJobSpec,
};
use crate::metrics::Metrics;
use crate::status_sync;
use crate::translate::{gpu_from_container, merge_env, GPU_RESOURCE};

/// Port of the per-pod tunnel Service.
const TUNNEL_SERVICE_PORT: i32 = 8080;

/// The custom resource a pod should be realised as.
#[derive(Clone, Debug, PartialEq)]
enum SiblingSpec {
    Job(ModalJobSpec),
    Function(ModalFunctionSpec),
    Endpoint(ModalEndpointSpec),
}

/// Watches pods and materializes their Modal-side custom resources.
pub struct PodWatcher {
    client: kube::Client,
    metrics: Arc<Metrics>,
}

impl PodWatcher {
    /// Create the watcher.
    pub fn new(client: kube::Client, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(PodWatcher { client, metrics })
    }

    /// Watch pods until the stream ends.
    pub async fn run(self: Arc<Self>) {
        let api: Api<Pod> = Api::all(self.client.clone());
        info!("Starting pod watcher");
        let mut stream = watcher::watcher(api, ListParams::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(pod)) => self.spawn_handle(pod),
                Ok(Event::Deleted(pod)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_deleted(pod).await });
                }
                Ok(Event::Restarted(pods)) => {
                    for pod in pods {
                        self.spawn_handle(pod);
                    }
                }
                Err(e) => warn!(error = %e, "Pod watch error, stream will resume"),
            }
        }
    }

    fn spawn_handle(self: &Arc<Self>, pod: Pod) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let name = pod.name();
            if let Err(e) = this.handle(pod).await {
                error!(error = %e, pod = %name, "Failed to process pod event");
                this.metrics.record_error("pod_event_failed", "pod_watcher");
            }
        });
    }

    #[instrument(level = "debug", skip(self, pod), fields(pod = %pod.name(), namespace = ?pod.namespace()))]
    async fn handle(&self, pod: Pod) -> anyhow::Result<()> {
        if pod.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        if pod.annotations().get(annotations::MUTATED).map(String::as_str) == Some("true") {
            self.ensure_tunnel_service(&pod).await?;
            self.ensure_sibling_resource(&pod).await?;
            if let Err(e) = status_sync::sync_pod(self.client.clone(), &pod).await {
                debug!(error = %e, "Status sync on pod update failed");
            }
            return Ok(());
        }

        // Legacy interception for clusters running without the webhook:
        // GPU pods and explicitly annotated pods become jobs directly.
        if should_offload(&pod) {
            self.create_legacy_job(&pod).await?;
        }
        Ok(())
    }

    async fn handle_deleted(&self, pod: Pod) {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_owned());
        let service = format!("{}-tunnel", pod.name());
        if let Err(e) =
            crate::controllers::delete_service(self.client.clone(), &namespace, &service).await
        {
            warn!(error = %e, %service, "Failed to delete tunnel service");
        }
    }

    /// Create the `<pod>-modal` resource for a mutated pod.
    async fn ensure_sibling_resource(&self, pod: &Pod) -> anyhow::Result<()> {
        let name = pod.name();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_owned());
        let resource_name = format!("{}-modal", name);

        let spec = match sibling_spec(pod) {
            Some(spec) => spec,
            None => {
                warn!("Mutated pod carries no capsule, skipping resource creation");
                return Ok(());
            }
        };

        let metadata = ObjectMeta {
            name: Some(resource_name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(
                [(annotations::ORIGINAL_POD.to_owned(), name.clone())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: owner_reference(pod).map(|o| vec![o]),
            ..Default::default()
        };

        match spec {
            SiblingSpec::Job(spec) => {
                let api: Api<ModalJob> = Api::namespaced(self.client.clone(), &namespace);
                if self.already_exists(api.get(&resource_name).await, "ModalJob", &resource_name) {
                    return Ok(());
                }
                let mut job = ModalJob::new(&resource_name, spec);
                job.metadata = metadata;
                self.create(api, &job, "ModalJob", &resource_name).await?;
            }
            SiblingSpec::Endpoint(spec) => {
                let api: Api<ModalEndpoint> = Api::namespaced(self.client.clone(), &namespace);
                if self.already_exists(
                    api.get(&resource_name).await,
                    "ModalEndpoint",
                    &resource_name,
                ) {
                    return Ok(());
                }
                let mut endpoint = ModalEndpoint::new(&resource_name, spec);
                endpoint.metadata = metadata;
                self.create(api, &endpoint, "ModalEndpoint", &resource_name)
                    .await?;
            }
            SiblingSpec::Function(spec) => {
                let api: Api<ModalFunction> = Api::namespaced(self.client.clone(), &namespace);
                if self.already_exists(
                    api.get(&resource_name).await,
                    "ModalFunction",
                    &resource_name,
                ) {
                    return Ok(());
                }
                let mut function = ModalFunction::new(&resource_name, spec);
                function.metadata = metadata;
                self.create(api, &function, "ModalFunction", &resource_name)
                    .await?;
            }
        }
        Ok(())
    }

    fn already_exists<K>(&self, lookup: kube::Result<K>, kind: &str, name: &str) -> bool {
        match lookup {
            Ok(_) => {
                debug!(%kind, %name, "Sibling resource already exists");
                true
            }
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                warn!(error = %e, %kind, %name, "Sibling lookup failed, attempting create");
                false
            }
        }
    }

    async fn create<K>(&self, api: Api<K>, obj: &K, kind: &str, name: &str) -> anyhow::Result<()>
    where
        K: kube::Resource<DynamicType = ()>
            + Clone
            + serde::Serialize
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
    {
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => {
                info!(%kind, %name, "Created sibling resource for mutated pod");
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                debug!(%kind, %name, "Sibling resource created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Legacy path: build a `ModalJob` straight from an unmutated pod.
    async fn create_legacy_job(&self, pod: &Pod) -> anyhow::Result<()> {
        let name = pod.name();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_owned());
        let resource_name = format!("{}-modal", name);

        let api: Api<ModalJob> = Api::namespaced(self.client.clone(), &namespace);
        if self.already_exists(api.get(&resource_name).await, "ModalJob", &resource_name) {
            return Ok(());
        }

        let spec = match legacy_job_spec(pod) {
            Some(spec) => spec,
            None => {
                warn!("Pod has no containers, skipping legacy interception");
                return Ok(());
            }
        };

        let mut job = ModalJob::new(&resource_name, spec);
        job.metadata = ObjectMeta {
            name: Some(resource_name.clone()),
            namespace: Some(namespace),
            labels: Some(
                [(annotations::ORIGINAL_POD.to_owned(), name.clone())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: owner_reference(pod).map(|o| vec![o]),
            ..Default::default()
        };
        self.create(api, &job, "ModalJob", &resource_name).await
    }

    /// Give the stand-in pod a stable in-cluster DNS name.
    async fn ensure_tunnel_service(&self, pod: &Pod) -> anyhow::Result<()> {
        let name = pod.name();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_owned());
        let service_name = format!("{}-tunnel", name);

        let mut labels = BTreeMap::new();
        labels.insert("app".to_owned(), name.clone());
        labels.insert(annotations::TUNNEL_LABEL.to_owned(), "true".to_owned());
        let mut svc_annotations = BTreeMap::new();
        svc_annotations.insert(annotations::ORIGINAL_POD.to_owned(), name.clone());
        let mut selector = BTreeMap::new();
        selector.insert(annotations::TUNNEL_POD_LABEL.to_owned(), name.clone());

        let service = Service {
            metadata: ObjectMeta {
                name: Some(service_name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels),
                annotations: Some(svc_annotations),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some("tunnel".to_owned()),
                    port: TUNNEL_SERVICE_PORT,
                    protocol: Some("TCP".to_owned()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), &service).await {
            Ok(_) => {
                info!(%service_name, "Created tunnel service");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn should_offload(pod: &Pod) -> bool {
    let annotations = pod.annotations();
    annotations.get(annotations::OFFLOAD).map(String::as_str) == Some("true")
        || annotations.get(annotations::USE_MODAL).map(String::as_str) == Some("true")
        || pod_requests_gpu(pod)
}

/// Decide which resource a mutated pod becomes and build its spec from
/// the capsule and annotations. Returns `None` when no capsule can be
/// recovered.
fn sibling_spec(pod: &Pod) -> Option<SiblingSpec> {
    let annotations = pod.annotations();
    let capsule = capsule_of(pod)?;

    let workload = pod
        .labels()
        .get(annotations::WORKLOAD_TYPE)
        .or_else(|| annotations.get(annotations::WORKLOAD_TYPE))
        .and_then(|v| WorkloadType::from_str(v).ok())
        .unwrap_or_else(|| {
            classify(&capsule.images, &capsule.commands, &capsule.args, annotations)
        });
    let kind = resource_kind(workload, !capsule.command().is_empty());

    let image = capsule.image().unwrap_or("python:3.11-slim").to_owned();
    let cpu = annotation_or(annotations, annotations::CPU, "1.0");
    let memory = annotation_or(annotations, annotations::MEMORY, "1Gi");
    let gpu = annotations.get(annotations::GPU).cloned();
    let timeout_seconds = annotations
        .get(annotations::TIMEOUT)
        .and_then(|v| v.parse().ok())
        .unwrap_or(600);

    Some(match kind {
        ResourceKind::Job => SiblingSpec::Job(ModalJobSpec {
            image,
            command: capsule.command().to_vec(),
            args: capsule.args().to_vec(),
            cpu,
            memory,
            gpu,
            env: capsule.env.clone(),
            timeout_seconds,
            tunnel: annotations.get(annotations::TUNNEL).map(String::as_str) == Some("true"),
            ..Default::default()
        }),
        ResourceKind::Endpoint => SiblingSpec::Endpoint(ModalEndpointSpec {
            image,
            command: capsule.command().to_vec(),
            args: capsule.args().to_vec(),
            cpu,
            memory,
            gpu,
            env: capsule.env.clone(),
            ..Default::default()
        }),
        ResourceKind::Function => SiblingSpec::Function(ModalFunctionSpec {
            image,
            cpu,
            memory,
            gpu,
            env: capsule.env.clone(),
            ..Default::default()
        }),
    })
}

/// Build a job spec from an unmutated pod's live containers and
/// annotations. Returns `None` when the pod has no containers.
fn legacy_job_spec(pod: &Pod) -> Option<ModalJobSpec> {
    let annotations = pod.annotations();
    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice())?;
    let first = containers.first()?;

    let image = annotations
        .get(annotations::IMAGE)
        .cloned()
        .or_else(|| first.image.clone())
        .unwrap_or_else(|| "python:3.11-slim".to_owned());
    let command = match annotations.get(annotations::COMMAND) {
        Some(command) if !command.trim().is_empty() => {
            command.split_whitespace().map(str::to_owned).collect()
        }
        _ => first.command.clone().unwrap_or_default(),
    };

    Some(ModalJobSpec {
        image,
        command,
        args: first.args.clone().unwrap_or_default(),
        cpu: annotation_or(annotations, annotations::CPU, "1.0"),
        memory: annotation_or(annotations, annotations::MEMORY, "512Mi"),
        gpu: gpu_from_container(first, annotations),
        env: merge_env(containers, annotations),
        timeout_seconds: annotations
            .get(annotations::TIMEOUT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(300),
        retries: annotations
            .get(annotations::RETRIES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        replicas: annotations
            .get(annotations::REPLICAS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
        enable_cluster_networking: annotations
            .get(annotations::ENABLE_I6PN)
            .map(String::as_str)
            == Some("true"),
        tunnel: annotations.get(annotations::TUNNEL).map(String::as_str) == Some("true"),
        tunnel_port: annotations
            .get(annotations::TUNNEL_PORT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000),
    })
}

fn annotation_or(annotations: &BTreeMap<String, String>, key: &str, default: &str) -> String {
    annotations
        .get(key)
        .cloned()
        .unwrap_or_else(|| default.to_owned())
}

/// The capsule of a mutated pod, read strictly by env-var name from the
/// logger container.
fn capsule_of(pod: &Pod) -> Option<Capsule> {
    let containers = pod.spec.as_ref()?.containers.as_slice();
    let logger = containers
        .iter()
        .find(|c| c.name == "logger")
        .or_else(|| containers.first())?;
    Capsule::from_env(&env_map(logger))
}

fn env_map(container: &Container) -> BTreeMap<String, String> {
    container
        .env
        .iter()
        .flatten()
        .filter_map(|var| var.value.clone().map(|value| (var.name.clone(), value)))
        .collect()
}

fn pod_requests_gpu(pod: &Pod) -> bool {
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .any(|container| {
            container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .map(|requests| requests.contains_key(GPU_RESOURCE))
                .unwrap_or(false)
        })
}

fn owner_reference(pod: &Pod) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "v1".to_owned(),
        kind: "Pod".to_owned(),
        name: pod.metadata.name.clone()?,
        uid: pod.metadata.uid.clone()?,
        controller: Some(true),
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{EnvVar, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn gpu_pod() -> Pod {
        let mut requests = BTreeMap::new();
        requests.insert(GPU_RESOURCE.to_owned(), Quantity("1".to_owned()));
        Pod {
            metadata: ObjectMeta {
                name: Some("cuda-smoke".to_owned()),
                namespace: Some("default".to_owned()),
                uid: Some("uid-1".to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_owned(),
                    image: Some("nvidia/cuda:11.8-runtime-ubuntu20.04".to_owned()),
                    command: Some(vec!["nvidia-smi".to_owned()]),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mutated_pod(extra_env: &[(&str, &str)]) -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(annotations::MUTATED.to_owned(), "true".to_owned());
        let mut env = vec![
            EnvVar {
                name: "ORIGINAL_IMAGES".to_owned(),
                value: Some(r#"["nvidia/cuda:11.8-runtime-ubuntu20.04"]"#.to_owned()),
                ..Default::default()
            },
            EnvVar {
                name: "ORIGINAL_COMMANDS".to_owned(),
                value: Some(r#"[["nvidia-smi"]]"#.to_owned()),
                ..Default::default()
            },
        ];
        env.extend(extra_env.iter().map(|(k, v)| EnvVar {
            name: (*k).to_owned(),
            value: Some((*v).to_owned()),
            ..Default::default()
        }));
        Pod {
            metadata: ObjectMeta {
                name: Some("demo".to_owned()),
                namespace: Some("default".to_owned()),
                uid: Some("uid-1".to_owned()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "logger".to_owned(),
                    env: Some(env),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn gpu_pod_becomes_a_legacy_job() {
        let pod = gpu_pod();
        assert!(should_offload(&pod));
        let spec = legacy_job_spec(&pod).expect("spec builds");
        assert_eq!(spec.image, "nvidia/cuda:11.8-runtime-ubuntu20.04");
        assert_eq!(spec.command, ["nvidia-smi"]);
        assert_eq!(spec.gpu.as_deref(), Some("T4:1"));
        assert_eq!(spec.cpu, "1.0");
    }

    #[test]
    fn annotation_overrides_shape_the_legacy_job() {
        let mut pod = gpu_pod();
        let mut a = BTreeMap::new();
        a.insert(annotations::GPU_TYPE.to_owned(), "A100".to_owned());
        a.insert(annotations::MEMORY.to_owned(), "4Gi".to_owned());
        a.insert(annotations::TIMEOUT.to_owned(), "1200".to_owned());
        a.insert(annotations::REPLICAS.to_owned(), "2".to_owned());
        a.insert(annotations::ENABLE_I6PN.to_owned(), "true".to_owned());
        a.insert(
            format!("{}WANDB_MODE", annotations::ENV_PREFIX),
            "offline".to_owned(),
        );
        pod.metadata.annotations = Some(a);

        let spec = legacy_job_spec(&pod).unwrap();
        assert_eq!(spec.gpu.as_deref(), Some("A100:1"));
        assert_eq!(spec.memory, "4Gi");
        assert_eq!(spec.timeout_seconds, 1200);
        assert_eq!(spec.replicas, 2);
        assert!(spec.enable_cluster_networking);
        assert_eq!(spec.env["WANDB_MODE"], "offline");
    }

    #[test]
    fn unannotated_cpu_pod_is_left_alone() {
        let mut pod = gpu_pod();
        pod.spec.as_mut().unwrap().containers[0].resources = None;
        assert!(!should_offload(&pod));
    }

    #[test]
    fn mutated_pod_with_batch_command_becomes_a_job() {
        let spec = sibling_spec(&mutated_pod(&[])).expect("sibling decided");
        match spec {
            SiblingSpec::Job(job) => {
                assert_eq!(job.image, "nvidia/cuda:11.8-runtime-ubuntu20.04");
                assert_eq!(job.command, ["nvidia-smi"]);
                assert_eq!(job.memory, "1Gi");
                assert_eq!(job.timeout_seconds, 600);
            }
            other => panic!("expected a job, got {:?}", other),
        }
    }

    #[test]
    fn function_label_with_command_becomes_an_endpoint() {
        let mut pod = mutated_pod(&[]);
        pod.metadata.labels = Some(
            [(annotations::WORKLOAD_TYPE.to_owned(), "function".to_owned())]
                .into_iter()
                .collect(),
        );
        match sibling_spec(&pod).unwrap() {
            SiblingSpec::Endpoint(endpoint) => {
                assert_eq!(endpoint.command, ["nvidia-smi"]);
                assert_eq!(endpoint.handler, "serve");
            }
            other => panic!("expected an endpoint, got {:?}", other),
        }
    }

    #[test]
    fn function_label_without_command_becomes_a_function() {
        let mut pod = mutated_pod(&[]);
        pod.metadata.labels = Some(
            [(annotations::WORKLOAD_TYPE.to_owned(), "function".to_owned())]
                .into_iter()
                .collect(),
        );
        // Replace the capsule with one that has no command.
        pod.spec.as_mut().unwrap().containers[0].env = Some(vec![EnvVar {
            name: "ORIGINAL_IMAGES".to_owned(),
            value: Some(r#"["tensorflow/serving:latest"]"#.to_owned()),
            ..Default::default()
        }]);
        match sibling_spec(&pod).unwrap() {
            SiblingSpec::Function(function) => {
                assert_eq!(function.image, "tensorflow/serving:latest");
            }
            other => panic!("expected a function, got {:?}", other),
        }
    }

    #[test]
    fn capsule_is_read_from_the_logger_container() {
        let capsule = capsule_of(&mutated_pod(&[("POD_NAME", "demo")])).expect("capsule present");
        assert_eq!(capsule.image(), Some("nvidia/cuda:11.8-runtime-ubuntu20.04"));
        assert_eq!(capsule.command(), ["nvidia-smi"]);
    }

    #[test]
    fn owner_reference_points_at_the_pod() {
        let owner = owner_reference(&gpu_pod()).expect("owner built");
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.name, "cuda-smoke");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));
    }
}
