//! Pod status projection
//!
//! The stand-in pod never runs the user's workload, but downstream
//! workload controllers judge health by its status. This module projects
//! the sibling resource's state onto the pod's status subresource: a
//! pending stand-in is reported `Running` with a synthetic container
//! status the moment the remote side takes over, and terminal remote
//! states are reflected as a terminated container. Writes are merge
//! no-ops when the observed state already matches.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations;
use crate::capsule::Capsule;
use crate::crd::{JobPhase, ModalJob};
use crate::metrics::Metrics;

/// Interval of the periodic sweep.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Synthetic pod IP reported for remotely executing pods.
const REMOTE_POD_IP: &str = "10.0.0.1";
/// Synthetic host IP marking the pod as running on the backend.
const REMOTE_HOST_IP: &str = "modal.com";

/// Periodically sweep all mutated pods and project their status.
pub async fn run(client: kube::Client, metrics: Arc<Metrics>) {
    info!("Starting status synchronizer");
    let api: Api<Pod> = Api::all(client.clone());
    // The tunnel-pod label is injected by mutation, so selecting on its
    // presence finds exactly the mutated pods.
    let params = ListParams::default().labels(annotations::TUNNEL_POD_LABEL);
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    loop {
        ticker.tick().await;
        let pods = match api.list(&params).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!(error = %e, "Failed to list mutated pods");
                metrics.record_error("pod_list_failed", "status_sync");
                continue;
            }
        };
        for pod in pods {
            let name = pod.name();
            if let Err(e) = sync_pod(client.clone(), &pod).await {
                error!(error = %e, pod = %name, "Status sync failed");
                metrics.record_error("status_sync_failed", "status_sync");
            }
        }
    }
}

/// Project remote state onto one pod. Returns whether a patch was
/// written.
#[instrument(level = "debug", skip(client, pod), fields(pod = %pod.name(), namespace = ?pod.namespace()))]
pub async fn sync_pod(client: kube::Client, pod: &Pod) -> anyhow::Result<bool> {
    if pod.annotations().get(annotations::MUTATED).map(String::as_str) != Some("true") {
        return Ok(false);
    }
    let name = pod.name();
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_owned());
    let current_phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");

    // The sibling job resource carries the remote terminal state, if any.
    let sibling = format!("{}-modal", name);
    let jobs: Api<ModalJob> = Api::namespaced(client.clone(), &namespace);
    let terminal = match jobs.get(&sibling).await {
        Ok(job) => job.status.and_then(|status| match status.phase {
            JobPhase::Succeeded => Some((JobPhase::Succeeded, 0, status.finished_at)),
            JobPhase::Failed => Some((JobPhase::Failed, 1, status.finished_at)),
            _ => None,
        }),
        Err(e) if crate::controllers::is_not_found(&e) => None,
        Err(e) => {
            debug!(error = %e, "Sibling lookup failed during status sync");
            None
        }
    };

    let patch = match terminal {
        Some((phase, exit_code, finished_at)) => {
            let phase_str = phase.to_string();
            if current_phase == phase_str {
                return Ok(false);
            }
            let (reason, message) = if exit_code == 0 {
                ("Completed", "Modal job completed on modal.com")
            } else {
                ("Error", "Modal job failed on modal.com")
            };
            serde_json::json!({
                "metadata": { "resourceVersion": "" },
                "status": {
                    "phase": phase_str,
                    "hostIP": REMOTE_HOST_IP,
                    "podIP": REMOTE_POD_IP,
                    "containerStatuses": [{
                        "name": primary_container_name(pod),
                        "image": primary_container_image(pod),
                        "imageID": format!("modal.com/{}", original_image(pod)),
                        "ready": false,
                        "restartCount": 0,
                        "started": false,
                        "state": {
                            "terminated": {
                                "exitCode": exit_code,
                                "reason": reason,
                                "finishedAt": finished_at.unwrap_or_else(crate::crd::now_rfc3339),
                                "message": message,
                            }
                        }
                    }]
                }
            })
        }
        None => {
            if current_phase != "Pending" {
                return Ok(false);
            }
            let started_at = pod
                .status
                .as_ref()
                .and_then(|s| s.start_time.as_ref())
                .map(|t| t.0.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .unwrap_or_else(crate::crd::now_rfc3339);
            serde_json::json!({
                "metadata": { "resourceVersion": "" },
                "status": {
                    "phase": "Running",
                    "hostIP": REMOTE_HOST_IP,
                    "podIP": REMOTE_POD_IP,
                    "containerStatuses": [{
                        "name": primary_container_name(pod),
                        "image": primary_container_image(pod),
                        "imageID": format!("modal.com/{}", original_image(pod)),
                        "ready": true,
                        "restartCount": 0,
                        "started": true,
                        "state": { "running": { "startedAt": started_at } }
                    }]
                }
            })
        }
    };

    let api: Api<Pod> = Api::namespaced(client, &namespace);
    api.patch_status(&name, &PatchParams::default(), &Patch::Strategic(&patch))
        .await?;
    info!(phase = %patch["status"]["phase"], "Projected remote state onto pod");
    Ok(true)
}

fn primary_container_name(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "logger".to_owned())
}

fn primary_container_image(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

/// The image the pod carried before mutation: the `original-image`
/// annotation when present, else the capsule, else the current image.
fn original_image(pod: &Pod) -> String {
    if let Some(image) = pod.annotations().get(annotations::ORIGINAL_IMAGE) {
        return image.clone();
    }
    if let Some(capsule) = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == "logger"))
        .or_else(|| pod.spec.as_ref().and_then(|s| s.containers.first()))
        .map(|container| {
            container
                .env
                .iter()
                .flatten()
                .filter_map(|var| var.value.clone().map(|value| (var.name.clone(), value)))
                .collect::<std::collections::BTreeMap<_, _>>()
        })
        .and_then(|env| Capsule::from_env(&env))
    {
        if let Some(image) = capsule.image() {
            return image.to_owned();
        }
    }
    primary_container_image(pod)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn mutated_pod() -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(annotations::MUTATED.to_owned(), "true".to_owned());
        Pod {
            metadata: ObjectMeta {
                name: Some("demo".to_owned()),
                namespace: Some("default".to_owned()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "logger".to_owned(),
                    image: Some("ghcr.io/modal-operator/modal-operator:latest".to_owned()),
                    env: Some(vec![EnvVar {
                        name: "ORIGINAL_IMAGES".to_owned(),
                        value: Some(r#"["python:3.11-slim"]"#.to_owned()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn original_image_prefers_the_annotation() {
        let mut pod = mutated_pod();
        pod.metadata.annotations.as_mut().unwrap().insert(
            annotations::ORIGINAL_IMAGE.to_owned(),
            "nvidia/cuda:11.8-runtime-ubuntu20.04".to_owned(),
        );
        assert_eq!(original_image(&pod), "nvidia/cuda:11.8-runtime-ubuntu20.04");
    }

    #[test]
    fn original_image_falls_back_to_the_capsule() {
        assert_eq!(original_image(&mutated_pod()), "python:3.11-slim");
    }

    #[test]
    fn primary_container_defaults() {
        let pod = mutated_pod();
        assert_eq!(primary_container_name(&pod), "logger");
        assert_eq!(
            primary_container_image(&pod),
            "ghcr.io/modal-operator/modal-operator:latest"
        );
    }
}
