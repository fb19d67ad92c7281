//! The original-spec capsule
//!
//! The admission mutator snapshots the fragment of the user's pod needed
//! to reconstitute the workload remotely and stores it, JSON-encoded, in
//! environment variables of the stand-in pod. Keeping it on the pod means
//! it survives admission without an external store, and a round trip
//! through the capsule preserves image strings and argv byte-exact.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use serde::{Deserialize, Serialize};

/// Env var holding the JSON array of original images.
pub const ORIGINAL_IMAGES: &str = "ORIGINAL_IMAGES";
/// Env var holding the JSON array of original container names.
pub const ORIGINAL_NAMES: &str = "ORIGINAL_NAMES";
/// Env var holding the JSON array of original commands.
pub const ORIGINAL_COMMANDS: &str = "ORIGINAL_COMMANDS";
/// Env var holding the JSON array of original args.
pub const ORIGINAL_ARGS: &str = "ORIGINAL_ARGS";
/// Env var holding the JSON object of merged original env.
pub const ORIGINAL_ENV: &str = "ORIGINAL_ENV";
/// Legacy single-image capsule used by pre-capsule mutations.
pub const ORIGINAL_IMAGE: &str = "ORIGINAL_IMAGE";

/// The preserved fragment of the original pod spec.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    /// Image per original container, in order
    pub images: Vec<String>,
    /// Name per original container, in order
    pub names: Vec<String>,
    /// Command per original container, in order
    pub commands: Vec<Vec<String>>,
    /// Args per original container, in order
    pub args: Vec<Vec<String>>,
    /// Merged env across containers, last writer wins in container order
    pub env: BTreeMap<String, String>,
}

impl Capsule {
    /// Snapshot the capsule fields from a pod's containers.
    pub fn from_containers(containers: &[Container]) -> Self {
        let mut env = BTreeMap::new();
        for container in containers {
            for var in container.env.iter().flatten() {
                env.insert(var.name.clone(), var.value.clone().unwrap_or_default());
            }
        }
        Capsule {
            images: containers
                .iter()
                .map(|c| c.image.clone().unwrap_or_default())
                .collect(),
            names: containers.iter().map(|c| c.name.clone()).collect(),
            commands: containers
                .iter()
                .map(|c| c.command.clone().unwrap_or_default())
                .collect(),
            args: containers
                .iter()
                .map(|c| c.args.clone().unwrap_or_default())
                .collect(),
            env,
        }
    }

    /// Encode the capsule as the five environment variables carried by the
    /// logger container.
    pub fn to_env(&self) -> Vec<(String, String)> {
        // Vec<String> and BTreeMap<String, String> always serialize.
        vec![
            (
                ORIGINAL_IMAGES.to_owned(),
                serde_json::to_string(&self.images).expect("capsule images serialize"),
            ),
            (
                ORIGINAL_NAMES.to_owned(),
                serde_json::to_string(&self.names).expect("capsule names serialize"),
            ),
            (
                ORIGINAL_COMMANDS.to_owned(),
                serde_json::to_string(&self.commands).expect("capsule commands serialize"),
            ),
            (
                ORIGINAL_ARGS.to_owned(),
                serde_json::to_string(&self.args).expect("capsule args serialize"),
            ),
            (
                ORIGINAL_ENV.to_owned(),
                serde_json::to_string(&self.env).expect("capsule env serializes"),
            ),
        ]
    }

    /// Decode a capsule from a container's environment, keyed strictly by
    /// variable name. Falls back to the legacy `ORIGINAL_IMAGE` variable
    /// when the full capsule is absent; returns `None` if no image can be
    /// recovered at all.
    pub fn from_env(env: &BTreeMap<String, String>) -> Option<Self> {
        if let Some(raw) = env.get(ORIGINAL_IMAGES) {
            let images: Vec<String> = serde_json::from_str(raw).ok()?;
            if images.is_empty() {
                return None;
            }
            return Some(Capsule {
                images,
                names: parse_or_default(env.get(ORIGINAL_NAMES)),
                commands: parse_or_default(env.get(ORIGINAL_COMMANDS)),
                args: parse_or_default(env.get(ORIGINAL_ARGS)),
                env: parse_or_default(env.get(ORIGINAL_ENV)),
            });
        }

        env.get(ORIGINAL_IMAGE).map(|image| Capsule {
            images: vec![image.clone()],
            ..Default::default()
        })
    }

    /// The canonical image (container index zero).
    pub fn image(&self) -> Option<&str> {
        self.images.first().map(String::as_str)
    }

    /// The canonical command (container index zero).
    pub fn command(&self) -> &[String] {
        self.commands.first().map(Vec::as_slice).unwrap_or_default()
    }

    /// The canonical args (container index zero).
    pub fn args(&self) -> &[String] {
        self.args.first().map(Vec::as_slice).unwrap_or_default()
    }
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(raw: Option<&String>) -> T {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::EnvVar;

    fn container(name: &str, image: &str, command: &[&str], args: &[&str]) -> Container {
        Container {
            name: name.to_owned(),
            image: Some(image.to_owned()),
            command: Some(command.iter().map(|s| s.to_string()).collect()),
            args: Some(args.iter().map(|s| s.to_string()).collect()),
            env: Some(vec![EnvVar {
                name: format!("{}_MODE", name.to_uppercase()),
                value: Some("fast".to_owned()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_is_byte_exact() {
        let containers = vec![
            container(
                "main",
                "nvidia/cuda:11.8-runtime-ubuntu20.04",
                &["nvidia-smi"],
                &["--query-gpu=name"],
            ),
            container("side", "busybox:1.36", &["sh", "-c"], &["echo side"]),
        ];
        let capsule = Capsule::from_containers(&containers);
        let env: BTreeMap<String, String> = capsule.to_env().into_iter().collect();
        let decoded = Capsule::from_env(&env).expect("capsule decodes");
        assert_eq!(decoded, capsule);
        assert_eq!(decoded.image(), Some("nvidia/cuda:11.8-runtime-ubuntu20.04"));
        assert_eq!(decoded.command(), ["nvidia-smi"]);
        assert_eq!(decoded.args(), ["--query-gpu=name"]);
        assert_eq!(decoded.env["MAIN_MODE"], "fast");
        assert_eq!(decoded.env["SIDE_MODE"], "fast");
    }

    #[test]
    fn decoding_keys_by_name_not_position() {
        // Extra unrelated variables in between must not matter.
        let mut env = BTreeMap::new();
        env.insert("POD_NAME".to_owned(), "demo".to_owned());
        env.insert("ZZ_LAST".to_owned(), "ignored".to_owned());
        env.insert(ORIGINAL_IMAGES.to_owned(), r#"["python:3.11-slim"]"#.to_owned());
        env.insert(ORIGINAL_COMMANDS.to_owned(), r#"[["python","-c"]]"#.to_owned());
        let capsule = Capsule::from_env(&env).expect("capsule decodes");
        assert_eq!(capsule.image(), Some("python:3.11-slim"));
        assert_eq!(capsule.command(), ["python", "-c"]);
    }

    #[test]
    fn legacy_single_image_fallback() {
        let mut env = BTreeMap::new();
        env.insert(ORIGINAL_IMAGE.to_owned(), "tensorflow/serving:latest".to_owned());
        let capsule = Capsule::from_env(&env).expect("legacy capsule decodes");
        assert_eq!(capsule.image(), Some("tensorflow/serving:latest"));
        assert!(capsule.command().is_empty());
    }

    #[test]
    fn no_capsule_yields_none() {
        assert_eq!(Capsule::from_env(&BTreeMap::new()), None);
    }
}
