//! Pod-shaped input to backend call shapes
//!
//! Everything in here is a total, I/O-free function: each either returns a
//! translated value or an error naming the offending field, which the
//! reconcilers surface as a `TranslationFailed_<field>` condition.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Container;
use modal_client::JobTask;
use thiserror::Error;

use crate::annotations;

/// Kubernetes resource name of a GPU device-plugin request.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// GPU type assumed when a request carries only a count.
pub const DEFAULT_GPU_TYPE: &str = "T4";

/// A translation failure, tagged with the field it concerns.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct TranslationError {
    /// The spec field that failed to translate
    pub field: &'static str,
    /// What was wrong with it
    pub message: String,
}

impl TranslationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        TranslationError {
            field,
            message: message.into(),
        }
    }

    /// The condition reason reconcilers report for this failure.
    pub fn reason(&self) -> String {
        format!("TranslationFailed_{}", self.field)
    }
}

/// Parse a Kubernetes memory quantity into MiB.
///
/// `"<n>Gi"` and `"<n>G"` scale by 1024, `"<n>Mi"` and `"<n>M"` pass
/// through, and a bare integer is taken as MiB already.
pub fn parse_memory_mib(quantity: &str) -> Result<u64, TranslationError> {
    let quantity = quantity.trim();
    let (digits, scale) = if let Some(n) = quantity.strip_suffix("Gi") {
        (n, 1024)
    } else if let Some(n) = quantity.strip_suffix("Mi") {
        (n, 1)
    } else if let Some(n) = quantity.strip_suffix('G') {
        (n, 1024)
    } else if let Some(n) = quantity.strip_suffix('M') {
        (n, 1)
    } else {
        (quantity, 1)
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| TranslationError::new("memory", format!("unparseable quantity {:?}", quantity)))?;
    Ok(value * scale)
}

/// Parse a CPU allocation into the decimal string the backend expects.
///
/// Millicore values are converted (`"250m"` becomes `"0.25"`); plain
/// decimal strings are validated and preserved verbatim.
pub fn parse_cpu(cpu: &str) -> Result<String, TranslationError> {
    let cpu = cpu.trim();
    if let Some(millis) = cpu.strip_suffix('m') {
        let millis: u64 = millis
            .parse()
            .map_err(|_| TranslationError::new("cpu", format!("unparseable millicores {:?}", cpu)))?;
        return Ok(format!("{}", millis as f64 / 1000.0));
    }
    match cpu.parse::<f64>() {
        Ok(value) if value > 0.0 => Ok(cpu.to_owned()),
        _ => Err(TranslationError::new(
            "cpu",
            format!("expected a positive decimal or millicores, got {:?}", cpu),
        )),
    }
}

/// A parsed GPU request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuSpec {
    /// Accelerator type, e.g. "T4"
    pub kind: String,
    /// Device count
    pub count: u32,
}

impl fmt::Display for GpuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.count)
    }
}

/// Parse a `"<type>:<count>"` GPU specification; a missing count
/// defaults to one.
pub fn parse_gpu(spec: &str) -> Result<GpuSpec, TranslationError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(TranslationError::new("gpu", "empty specification"));
    }
    match spec.split_once(':') {
        None => Ok(GpuSpec {
            kind: spec.to_owned(),
            count: 1,
        }),
        Some((kind, count)) => {
            let count: u32 = count.parse().map_err(|_| {
                TranslationError::new("gpu", format!("unparseable count in {:?}", spec))
            })?;
            if kind.is_empty() || count == 0 {
                return Err(TranslationError::new(
                    "gpu",
                    format!("expected <type>:<count>, got {:?}", spec),
                ));
            }
            Ok(GpuSpec {
                kind: kind.to_owned(),
                count,
            })
        }
    }
}

/// Derive the GPU specification for a container, if any.
///
/// An explicit `modal-operator.io/gpu` annotation wins; otherwise a
/// `nvidia.com/gpu` request maps to `"<annotatedType|T4>:<count>"`.
pub fn gpu_from_container(
    container: &Container,
    annotations: &BTreeMap<String, String>,
) -> Option<String> {
    if let Some(gpu) = annotations.get(annotations::GPU) {
        return Some(gpu.clone());
    }
    let requests = container.resources.as_ref()?.requests.as_ref()?;
    let count = requests.get(GPU_RESOURCE)?;
    let gpu_type = annotations
        .get(annotations::GPU_TYPE)
        .map(String::as_str)
        .unwrap_or(DEFAULT_GPU_TYPE);
    Some(format!("{}:{}", gpu_type, count.0))
}

/// Merge environment variables across containers and annotations.
///
/// Containers are visited in order with the last writer winning, then
/// `modal-operator.io/env-<KEY>` annotations are applied on top, winning
/// on collision.
pub fn merge_env(
    containers: &[Container],
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for container in containers {
        for var in container.env.iter().flatten() {
            env.insert(var.name.clone(), var.value.clone().unwrap_or_default());
        }
    }
    for (key, value) in annotations {
        if let Some(name) = key.strip_prefix(annotations::ENV_PREFIX) {
            env.insert(name.to_owned(), value.clone());
        }
    }
    env
}

/// Expand a job into its per-replica tasks.
///
/// Each task carries `RANK` and `WORLD_SIZE` in the environment and has
/// `{rank}` / `{worldSize}` tokens substituted inside the argv.
pub fn expand_replicas(
    command: &[String],
    args: &[String],
    env: &BTreeMap<String, String>,
    replicas: u32,
) -> Vec<JobTask> {
    let replicas = replicas.max(1);
    (0..replicas)
        .map(|rank| {
            let mut env = env.clone();
            if replicas > 1 {
                env.insert("RANK".to_owned(), rank.to_string());
                env.insert("WORLD_SIZE".to_owned(), replicas.to_string());
            }
            JobTask {
                rank,
                world_size: replicas,
                command: substitute(command, rank, replicas),
                args: substitute(args, rank, replicas),
                env,
            }
        })
        .collect()
}

fn substitute(argv: &[String], rank: u32, world_size: u32) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            arg.replace("{rank}", &rank.to_string())
                .replace("{worldSize}", &world_size.to_string())
                .replace("{world_size}", &world_size.to_string())
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory_mib("2Gi").unwrap(), 2048);
        assert_eq!(parse_memory_mib("2G").unwrap(), 2048);
        assert_eq!(parse_memory_mib("512Mi").unwrap(), 512);
        assert_eq!(parse_memory_mib("512M").unwrap(), 512);
        assert_eq!(parse_memory_mib("512").unwrap(), 512);
        assert!(parse_memory_mib("invalid").is_err());
        assert!(parse_memory_mib("1.5Gi").is_err());
    }

    #[test]
    fn memory_error_names_the_field() {
        let err = parse_memory_mib("lots").unwrap_err();
        assert_eq!(err.field, "memory");
        assert_eq!(err.reason(), "TranslationFailed_memory");
    }

    #[test]
    fn cpu_millicores_become_decimals() {
        assert_eq!(parse_cpu("250m").unwrap(), "0.25");
        assert_eq!(parse_cpu("1500m").unwrap(), "1.5");
        assert_eq!(parse_cpu("1000m").unwrap(), "1");
    }

    #[test]
    fn cpu_decimals_are_preserved_verbatim() {
        assert_eq!(parse_cpu("1.0").unwrap(), "1.0");
        assert_eq!(parse_cpu("0.5").unwrap(), "0.5");
        assert!(parse_cpu("zero").is_err());
        assert!(parse_cpu("-1").is_err());
    }

    #[test]
    fn gpu_count_defaults_to_one() {
        assert_eq!(
            parse_gpu("T4").unwrap(),
            GpuSpec {
                kind: "T4".into(),
                count: 1
            }
        );
        assert_eq!(parse_gpu("A100:2").unwrap().to_string(), "A100:2");
        assert!(parse_gpu("T4:many").is_err());
        assert!(parse_gpu(":2").is_err());
    }

    fn container_with_gpu(count: &str) -> Container {
        let mut requests = std::collections::BTreeMap::new();
        requests.insert(GPU_RESOURCE.to_owned(), Quantity(count.to_owned()));
        Container {
            name: "main".to_owned(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn gpu_request_maps_to_default_type() {
        let container = container_with_gpu("1");
        let gpu = gpu_from_container(&container, &BTreeMap::new());
        assert_eq!(gpu, Some("T4:1".to_owned()));
    }

    #[test]
    fn gpu_type_annotation_overrides_default() {
        let container = container_with_gpu("2");
        let mut annotations = BTreeMap::new();
        annotations.insert(annotations::GPU_TYPE.to_owned(), "A100".to_owned());
        assert_eq!(
            gpu_from_container(&container, &annotations),
            Some("A100:2".to_owned())
        );
    }

    #[test]
    fn gpu_annotation_wins_over_resources() {
        let container = container_with_gpu("1");
        let mut annotations = BTreeMap::new();
        annotations.insert(annotations::GPU.to_owned(), "H100:4".to_owned());
        assert_eq!(
            gpu_from_container(&container, &annotations),
            Some("H100:4".to_owned())
        );
    }

    fn container_with_env(name: &str, pairs: &[(&str, &str)]) -> Container {
        Container {
            name: name.to_owned(),
            env: Some(
                pairs
                    .iter()
                    .map(|(k, v)| EnvVar {
                        name: (*k).to_owned(),
                        value: Some((*v).to_owned()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn env_merge_is_last_writer_wins_in_container_order() {
        let containers = vec![
            container_with_env("first", &[("SHARED", "one"), ("A", "a")]),
            container_with_env("second", &[("SHARED", "two"), ("B", "b")]),
        ];
        let env = merge_env(&containers, &BTreeMap::new());
        assert_eq!(env["SHARED"], "two");
        assert_eq!(env["A"], "a");
        assert_eq!(env["B"], "b");
    }

    #[test]
    fn env_annotations_win_on_collision() {
        let containers = vec![container_with_env("only", &[("MODE", "container")])];
        let mut annotations = BTreeMap::new();
        annotations.insert(
            format!("{}MODE", annotations::ENV_PREFIX),
            "annotation".to_owned(),
        );
        annotations.insert(
            format!("{}EXTRA", annotations::ENV_PREFIX),
            "added".to_owned(),
        );
        let env = merge_env(&containers, &annotations);
        assert_eq!(env["MODE"], "annotation");
        assert_eq!(env["EXTRA"], "added");
    }

    #[test]
    fn single_replica_has_no_rank_env() {
        let tasks = expand_replicas(
            &["python".to_owned()],
            &["train.py".to_owned()],
            &BTreeMap::new(),
            1,
        );
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].env.contains_key("RANK"));
    }

    #[test]
    fn replicas_expand_with_rank_and_world_size() {
        let args = vec!["--rank={rank}".to_owned(), "--world={worldSize}".to_owned()];
        let tasks = expand_replicas(&["python".to_owned()], &args, &BTreeMap::new(), 3);
        assert_eq!(tasks.len(), 3);
        for (rank, task) in tasks.iter().enumerate() {
            assert_eq!(task.env["RANK"], rank.to_string());
            assert_eq!(task.env["WORLD_SIZE"], "3");
            assert_eq!(task.args[0], format!("--rank={}", rank));
            assert_eq!(task.args[1], "--world=3");
        }
    }
}
