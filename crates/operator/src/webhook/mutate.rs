//! Construction of the admission patch
//!
//! Pure over the admission payload: the same pod always produces the same
//! ordered patch, and a malformed pod produces an error (which the server
//! turns into a denial), never a malformed patch.

use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, ResourceRequirements,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

use crate::annotations;
use crate::capsule::Capsule;

/// Port the logger container exposes to stand in for the workload.
const PLACEHOLDER_PORT: i32 = 8000;
/// Port the sidecar proxy listens on.
const PROXY_PORT: i32 = 1080;
/// Mount path of the credential secret inside the stand-in pod.
const SECRET_MOUNT_PATH: &str = "/etc/modal-secret";
/// Volume name of the credential secret.
const SECRET_VOLUME: &str = "modal-secret";

/// What the mutator needs to know about its surroundings.
#[derive(Clone, Debug)]
pub struct MutationConfig {
    /// Image the logger and proxy containers run
    pub operator_image: String,
    /// Name of the secret holding the Modal token pair
    pub secret_name: String,
}

impl Default for MutationConfig {
    fn default() -> Self {
        MutationConfig {
            operator_image: "ghcr.io/modal-operator/modal-operator:latest".to_owned(),
            secret_name: "modal-token".to_owned(),
        }
    }
}

/// Structural problems that make a pod unmutatable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    /// The pod has no containers at all.
    #[error("pod must have at least one container")]
    NoContainers,
    /// The first container has no name.
    #[error("container must have a name")]
    MissingName,
    /// The first container has no image.
    #[error("container must have an image")]
    MissingImage,
}

/// Rewrite a pod for remote execution.
///
/// The returned operations, in order: replace the containers with the
/// logger + proxy pair, preserve the original networking configuration,
/// force in-cluster networking, mount the credential secret, and mark the
/// pod as mutated.
pub fn mutate(pod: &Pod, config: &MutationConfig) -> Result<Patch, MutationError> {
    let spec = pod.spec.as_ref().ok_or(MutationError::NoContainers)?;
    let containers = &spec.containers;
    if containers.is_empty() {
        return Err(MutationError::NoContainers);
    }
    let first = &containers[0];
    if first.name.is_empty() {
        return Err(MutationError::MissingName);
    }
    match first.image.as_deref() {
        None | Some("") => return Err(MutationError::MissingImage),
        Some(_) => (),
    }

    let pod_name = pod.metadata.name.as_deref().unwrap_or("unknown");
    let capsule = Capsule::from_containers(containers);

    let mut ops = Vec::new();

    ops.push(PatchOperation::Replace(ReplaceOperation {
        path: "/spec/containers".to_owned(),
        value: serde_json::to_value(vec![
            logger_container(pod_name, &capsule, config),
            proxy_container(pod_name, config),
        ])
        .expect("containers serialize"),
    }));

    // Annotation member paths below require the map to exist.
    if pod.metadata.annotations.is_none() {
        ops.push(PatchOperation::Add(AddOperation {
            path: "/metadata/annotations".to_owned(),
            value: serde_json::json!({}),
        }));
    }

    let networking = serde_json::json!({
        "hostNetwork": spec.host_network.unwrap_or(false),
        "dnsPolicy": spec.dns_policy.as_deref().unwrap_or("ClusterFirst"),
        "subdomain": spec.subdomain,
        "hostname": spec.hostname,
        "dnsConfig": spec.dns_config,
    });
    ops.push(PatchOperation::Add(AddOperation {
        path: escape_annotation(annotations::ORIGINAL_NETWORKING),
        value: serde_json::Value::String(networking.to_string()),
    }));

    // The stand-in never keeps host networking, and needs cluster DNS to
    // reach in-cluster services through the sidecar.
    if spec.host_network == Some(true) {
        ops.push(PatchOperation::Replace(ReplaceOperation {
            path: "/spec/hostNetwork".to_owned(),
            value: serde_json::json!(false),
        }));
    }
    let dns_policy = serde_json::json!("ClusterFirst");
    ops.push(if spec.dns_policy.is_some() {
        PatchOperation::Replace(ReplaceOperation {
            path: "/spec/dnsPolicy".to_owned(),
            value: dns_policy,
        })
    } else {
        PatchOperation::Add(AddOperation {
            path: "/spec/dnsPolicy".to_owned(),
            value: dns_policy,
        })
    });

    let secret_volume = serde_json::to_value(Volume {
        name: SECRET_VOLUME.to_owned(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(config.secret_name.clone()),
            optional: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    })
    .expect("volume serializes");
    ops.push(if spec.volumes.is_some() {
        PatchOperation::Add(AddOperation {
            path: "/spec/volumes/-".to_owned(),
            value: secret_volume,
        })
    } else {
        PatchOperation::Add(AddOperation {
            path: "/spec/volumes".to_owned(),
            value: serde_json::Value::Array(vec![secret_volume]),
        })
    });

    ops.push(PatchOperation::Add(AddOperation {
        path: escape_annotation(annotations::MUTATED),
        value: serde_json::json!("true"),
    }));
    ops.push(PatchOperation::Add(AddOperation {
        path: escape_annotation(annotations::TUNNEL_ENABLED),
        value: serde_json::json!("true"),
    }));

    if pod.metadata.labels.is_none() {
        ops.push(PatchOperation::Add(AddOperation {
            path: "/metadata/labels".to_owned(),
            value: serde_json::json!({ (annotations::TUNNEL_POD_LABEL): pod_name }),
        }));
    } else {
        ops.push(PatchOperation::Add(AddOperation {
            path: format!(
                "/metadata/labels/{}",
                annotations::TUNNEL_POD_LABEL.replace('/', "~1")
            ),
            value: serde_json::json!(pod_name),
        }));
    }

    Ok(Patch(ops))
}

fn escape_annotation(key: &str) -> String {
    format!("/metadata/annotations/{}", key.replace('/', "~1"))
}

fn logger_container(pod_name: &str, capsule: &Capsule, config: &MutationConfig) -> Container {
    let mut env = vec![
        EnvVar {
            name: "POD_NAME".to_owned(),
            value: Some(pod_name.to_owned()),
            ..Default::default()
        },
        EnvVar {
            name: "POD_NAMESPACE".to_owned(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_owned(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "MODAL_EXECUTION".to_owned(),
            value: Some("true".to_owned()),
            ..Default::default()
        },
    ];
    env.extend(capsule.to_env().into_iter().map(|(name, value)| EnvVar {
        name,
        value: Some(value),
        ..Default::default()
    }));
    env.extend(
        [
            ("HTTP_PROXY", "socks5://localhost:1080"),
            ("HTTPS_PROXY", "socks5://localhost:1080"),
            ("MODAL_OPERATOR_PROXY", "localhost:1080"),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_owned(),
            value: Some(value.to_owned()),
            ..Default::default()
        }),
    );

    Container {
        name: "logger".to_owned(),
        image: Some(config.operator_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        command: Some(vec!["modal-logger".to_owned()]),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: PLACEHOLDER_PORT,
            name: Some("placeholder".to_owned()),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![secret_mount()]),
        ..Default::default()
    }
}

fn proxy_container(pod_name: &str, config: &MutationConfig) -> Container {
    Container {
        name: "proxy".to_owned(),
        image: Some(config.operator_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        command: Some(vec!["modal-proxy".to_owned()]),
        env: Some(vec![
            EnvVar {
                name: "PROXY_PORT".to_owned(),
                value: Some(PROXY_PORT.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "POD_NAME".to_owned(),
                value: Some(pod_name.to_owned()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![ContainerPort {
            container_port: PROXY_PORT,
            name: Some("proxy".to_owned()),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(
                [
                    ("memory".to_owned(), Quantity("64Mi".to_owned())),
                    ("cpu".to_owned(), Quantity("50m".to_owned())),
                ]
                .into_iter()
                .collect(),
            ),
            limits: Some(
                [
                    ("memory".to_owned(), Quantity("128Mi".to_owned())),
                    ("cpu".to_owned(), Quantity("100m".to_owned())),
                ]
                .into_iter()
                .collect(),
            ),
        }),
        volume_mounts: Some(vec![secret_mount()]),
        ..Default::default()
    }
}

fn secret_mount() -> VolumeMount {
    VolumeMount {
        name: SECRET_VOLUME.to_owned(),
        mount_path: SECRET_MOUNT_PATH.to_owned(),
        read_only: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn test_pod() -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(annotations::OFFLOAD.to_owned(), "true".to_owned());
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_owned()),
                namespace: Some("default".to_owned()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_owned(),
                    image: Some("python:3.11-slim".to_owned()),
                    command: Some(vec![
                        "python".to_owned(),
                        "-c".to_owned(),
                        "print('test')".to_owned(),
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn as_values(patch: &Patch) -> Vec<serde_json::Value> {
        serde_json::to_value(patch)
            .unwrap()
            .as_array()
            .unwrap()
            .clone()
    }

    #[test]
    fn replaces_containers_with_logger_and_proxy() {
        let patch = mutate(&test_pod(), &MutationConfig::default()).expect("mutation succeeds");
        let ops = as_values(&patch);

        assert_eq!(ops[0]["op"], "replace");
        assert_eq!(ops[0]["path"], "/spec/containers");
        let containers = ops[0]["value"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["name"], "logger");
        assert_eq!(containers[1]["name"], "proxy");

        let env = containers[0]["env"].as_array().unwrap();
        let find = |name: &str| {
            env.iter()
                .find(|v| v["name"] == name)
                .unwrap_or_else(|| panic!("env {} missing", name))["value"]
                .clone()
        };
        assert_eq!(find("MODAL_EXECUTION"), "true");
        assert_eq!(find("ORIGINAL_IMAGES"), "[\"python:3.11-slim\"]");
        assert_eq!(
            find("ORIGINAL_COMMANDS"),
            "[[\"python\",\"-c\",\"print('test')\"]]"
        );
        assert_eq!(find("HTTP_PROXY"), "socks5://localhost:1080");
    }

    #[test]
    fn marks_the_pod_mutated_and_labelled() {
        let patch = mutate(&test_pod(), &MutationConfig::default()).unwrap();
        let ops = as_values(&patch);

        assert!(ops.iter().any(|op| {
            op["op"] == "add"
                && op["path"] == "/metadata/annotations/modal-operator.io~1mutated"
                && op["value"] == "true"
        }));
        assert!(ops.iter().any(|op| {
            op["path"] == "/metadata/annotations/modal-operator.io~1tunnel-enabled"
        }));
        // No labels on the input pod, so the whole map is created.
        assert!(ops.iter().any(|op| {
            op["path"] == "/metadata/labels"
                && op["value"]["modal-operator.io/tunnel-pod"] == "test-pod"
        }));
    }

    #[test]
    fn preserves_and_overrides_networking() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().host_network = Some(true);
        pod.spec.as_mut().unwrap().dns_policy = Some("Default".to_owned());

        let patch = mutate(&pod, &MutationConfig::default()).unwrap();
        let ops = as_values(&patch);

        let networking = ops
            .iter()
            .find(|op| op["path"] == "/metadata/annotations/modal-operator.io~1original-networking")
            .expect("networking capsule present");
        let preserved: serde_json::Value =
            serde_json::from_str(networking["value"].as_str().unwrap()).unwrap();
        assert_eq!(preserved["hostNetwork"], true);
        assert_eq!(preserved["dnsPolicy"], "Default");

        assert!(ops.iter().any(|op| {
            op["op"] == "replace" && op["path"] == "/spec/hostNetwork" && op["value"] == false
        }));
        assert!(ops.iter().any(|op| {
            op["op"] == "replace"
                && op["path"] == "/spec/dnsPolicy"
                && op["value"] == "ClusterFirst"
        }));
    }

    #[test]
    fn mounts_the_credential_secret() {
        let patch = mutate(&test_pod(), &MutationConfig::default()).unwrap();
        let ops = as_values(&patch);

        // Pod with no volumes gets the whole array.
        let volume_op = ops
            .iter()
            .find(|op| op["path"] == "/spec/volumes")
            .expect("volume op present");
        assert_eq!(volume_op["value"][0]["name"], "modal-secret");
        assert_eq!(volume_op["value"][0]["secret"]["secretName"], "modal-token");
        assert_eq!(volume_op["value"][0]["secret"]["optional"], false);
    }

    #[test]
    fn appends_to_existing_volumes() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "scratch".to_owned(),
            ..Default::default()
        }]);
        let patch = mutate(&pod, &MutationConfig::default()).unwrap();
        let ops = as_values(&patch);
        assert!(ops.iter().any(|op| op["path"] == "/spec/volumes/-"));
    }

    #[test]
    fn mutation_is_deterministic() {
        let pod = test_pod();
        let config = MutationConfig::default();
        let first = serde_json::to_value(mutate(&pod, &config).unwrap()).unwrap();
        let second = serde_json::to_value(mutate(&pod, &config).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_structurally_invalid_pods() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers.clear();
        assert_eq!(
            mutate(&pod, &MutationConfig::default()),
            Err(MutationError::NoContainers)
        );

        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].image = None;
        assert_eq!(
            mutate(&pod, &MutationConfig::default()),
            Err(MutationError::MissingImage)
        );

        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].name = String::new();
        assert_eq!(
            mutate(&pod, &MutationConfig::default()),
            Err(MutationError::MissingName)
        );
    }
}
