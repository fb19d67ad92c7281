//! Custom resources of the `modal-operator.io/v1alpha1` group
//!
//! Three kinds cover the workload shapes the backend offers: `ModalJob`
//! (batch execution), `ModalFunction` (callable handler) and
//! `ModalEndpoint` (long-lived HTTP service). All of them carry a status
//! subresource that the reconcilers own; users never write status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_cpu() -> String {
    "1.0".to_owned()
}

fn default_memory() -> String {
    "512Mi".to_owned()
}

fn default_timeout() -> u32 {
    300
}

fn default_replicas() -> u32 {
    1
}

fn default_concurrency() -> u32 {
    1
}

fn default_tunnel_port() -> u16 {
    8000
}

fn default_max_replicas() -> u32 {
    10
}

fn default_handler() -> String {
    "serve".to_owned()
}

/// Batch execution on the backend.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "modal-operator.io",
    version = "v1alpha1",
    kind = "ModalJob",
    status = "ModalJobStatus",
    derive = "Default",
    namespaced,
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\"}"
)]
#[serde(rename_all = "camelCase")]
pub struct ModalJobSpec {
    /// Container image to run, preserved byte-exact
    pub image: String,
    /// Entrypoint command
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// CPU allocation as a decimal string, e.g. "1.0" or "250m"
    #[serde(default = "default_cpu")]
    pub cpu: String,
    /// Memory allocation as a Kubernetes quantity (Mi/Gi)
    #[serde(default = "default_memory")]
    pub memory: String,
    /// GPU specification such as "T4:1"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    /// Environment variables passed to the remote execution
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Job timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    /// Retry budget
    #[serde(default)]
    pub retries: u32,
    /// Replica count; values above one require cluster networking
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Whether replicas join the backend's private network
    #[serde(default)]
    pub enable_cluster_networking: bool,
    /// Whether the job gets a tunnel back into the cluster
    #[serde(default)]
    pub tunnel: bool,
    /// Port the tunnel forwards to
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,
}

impl Default for ModalJobSpec {
    fn default() -> Self {
        ModalJobSpec {
            image: String::new(),
            command: Vec::new(),
            args: Vec::new(),
            cpu: default_cpu(),
            memory: default_memory(),
            gpu: None,
            env: BTreeMap::new(),
            timeout_seconds: default_timeout(),
            retries: 0,
            replicas: default_replicas(),
            enable_cluster_networking: false,
            tunnel: false,
            tunnel_port: default_tunnel_port(),
        }
    }
}

/// Lifecycle phase of a [`ModalJob`].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum JobPhase {
    /// Accepted but not yet submitted
    #[default]
    Pending,
    /// Submitted and executing remotely
    Running,
    /// Remote execution finished without error
    Succeeded,
    /// Remote execution failed or could not be created
    Failed,
}

/// Status of a [`ModalJob`], owned by the job reconciler.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModalJobStatus {
    /// Current phase
    #[serde(default)]
    pub phase: JobPhase,
    /// Backend app id; immutable once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_app_id: Option<String>,
    /// Backend function call id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_function_id: Option<String>,
    /// Tunnel URL back into the cluster, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
    /// Link to the backend's log view
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    /// Submission timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Remote start timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Remote completion timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Condition history
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Callable short-lived handler on the backend.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "modal-operator.io",
    version = "v1alpha1",
    kind = "ModalFunction",
    status = "ModalFunctionStatus",
    derive = "Default",
    namespaced,
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\"}"
)]
#[serde(rename_all = "camelCase")]
pub struct ModalFunctionSpec {
    /// Container image for the function
    pub image: String,
    /// Dotted handler path resolved in the remote environment
    #[serde(default = "default_handler")]
    pub handler: String,
    /// CPU allocation as a decimal string
    #[serde(default = "default_cpu")]
    pub cpu: String,
    /// Memory allocation as a Kubernetes quantity
    #[serde(default = "default_memory")]
    pub memory: String,
    /// GPU specification such as "T4:1"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    /// Maximum concurrent executions
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

impl Default for ModalFunctionSpec {
    fn default() -> Self {
        ModalFunctionSpec {
            image: String::new(),
            handler: default_handler(),
            cpu: default_cpu(),
            memory: default_memory(),
            gpu: None,
            env: BTreeMap::new(),
            timeout_seconds: default_timeout(),
            concurrency: default_concurrency(),
        }
    }
}

/// Lifecycle phase of a [`ModalFunction`].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum FunctionPhase {
    /// Accepted but not yet deployed
    #[default]
    Pending,
    /// Deployed and callable
    Deployed,
    /// Deployment failed
    Failed,
}

/// Status of a [`ModalFunction`].
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModalFunctionStatus {
    /// Current phase
    #[serde(default)]
    pub phase: FunctionPhase,
    /// Backend app id; immutable once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_app_id: Option<String>,
    /// Invocation URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_url: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Condition history
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Long-lived HTTP service on the backend.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "modal-operator.io",
    version = "v1alpha1",
    kind = "ModalEndpoint",
    status = "ModalEndpointStatus",
    derive = "Default",
    namespaced,
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\"}"
)]
#[serde(rename_all = "camelCase")]
pub struct ModalEndpointSpec {
    /// Container image for the endpoint
    pub image: String,
    /// Handler path; ignored when a command is present
    #[serde(default = "default_handler")]
    pub handler: String,
    /// HTTP server command wrapped behind the endpoint
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// CPU allocation as a decimal string
    #[serde(default = "default_cpu")]
    pub cpu: String,
    /// Memory allocation as a Kubernetes quantity
    #[serde(default = "default_memory")]
    pub memory: String,
    /// GPU specification such as "T4:1"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Autoscaling floor
    #[serde(default)]
    pub min_replicas: u32,
    /// Autoscaling ceiling; must not be below the floor
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
}

impl Default for ModalEndpointSpec {
    fn default() -> Self {
        ModalEndpointSpec {
            image: String::new(),
            handler: default_handler(),
            command: Vec::new(),
            args: Vec::new(),
            cpu: default_cpu(),
            memory: default_memory(),
            gpu: None,
            env: BTreeMap::new(),
            min_replicas: 0,
            max_replicas: default_max_replicas(),
        }
    }
}

/// Lifecycle phase of a [`ModalEndpoint`].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EndpointPhase {
    /// Accepted but not yet deployed
    #[default]
    Pending,
    /// Deployed and serving
    Ready,
    /// Deployment failed
    Failed,
}

/// Status of a [`ModalEndpoint`].
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModalEndpointStatus {
    /// Current phase
    #[serde(default)]
    pub phase: EndpointPhase,
    /// Backend app id; immutable once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_app_id: Option<String>,
    /// Public HTTPS URL of the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    /// Replicas currently serving
    #[serde(default)]
    pub ready_replicas: u32,
    /// Condition history
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A single status condition, mirroring the Kubernetes condition shape.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type; the reconcilers only write `Ready`
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False"
    pub status: String,
    /// RFC 3339 timestamp of the last transition
    pub last_transition_time: String,
    /// Machine-readable reason, e.g. `JobCreated`
    pub reason: String,
    /// Human-readable detail
    pub message: String,
}

impl Condition {
    /// A `Ready=True` condition with the given reason and message.
    pub fn ready(reason: &str, message: &str) -> Self {
        Condition::new("True", reason, message)
    }

    /// A `Ready=False` condition with the given reason and message.
    pub fn not_ready(reason: &str, message: &str) -> Self {
        Condition::new("False", reason, message)
    }

    fn new(status: &str, reason: &str, message: &str) -> Self {
        Condition {
            type_: "Ready".to_owned(),
            status: status.to_owned(),
            last_transition_time: now_rfc3339(),
            reason: reason.to_owned(),
            message: message.to_owned(),
        }
    }
}

/// The current time as a Z-suffixed RFC 3339 string, the format every
/// timestamp in these statuses uses.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

macro_rules! phase_strings {
    ($phase:ty { $($variant:ident),+ }) => {
        impl fmt::Display for $phase {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(<$phase>::$variant => write!(f, stringify!($variant)),)+
                }
            }
        }

        impl FromStr for $phase {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok(<$phase>::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

phase_strings!(JobPhase { Pending, Running, Succeeded, Failed });
phase_strings!(FunctionPhase { Pending, Deployed, Failed });
phase_strings!(EndpointPhase { Pending, Ready, Failed });

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_spec_defaults_apply() {
        let spec: ModalJobSpec =
            serde_json::from_value(serde_json::json!({ "image": "python:3.11-slim" }))
                .expect("minimal spec parses");
        assert_eq!(spec.cpu, "1.0");
        assert_eq!(spec.memory, "512Mi");
        assert_eq!(spec.timeout_seconds, 300);
        assert_eq!(spec.replicas, 1);
        assert!(!spec.enable_cluster_networking);
        assert_eq!(spec.tunnel_port, 8000);
    }

    #[test]
    fn spec_round_trips_camel_case() {
        let spec = ModalJobSpec {
            image: "nvidia/cuda:11.8-runtime-ubuntu20.04".to_owned(),
            command: vec!["nvidia-smi".to_owned()],
            timeout_seconds: 600,
            enable_cluster_networking: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["timeoutSeconds"], 600);
        assert_eq!(value["enableClusterNetworking"], true);
        let back: ModalJobSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn status_serializes_remote_ids_camel_case() {
        let status = ModalJobStatus {
            phase: JobPhase::Running,
            remote_app_id: Some("ap-123".to_owned()),
            remote_function_id: Some("fc-456".to_owned()),
            log_url: Some("https://modal.com/apps/ap-123".to_owned()),
            conditions: vec![Condition::ready("JobCreated", "created")],
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["remoteAppId"], "ap-123");
        assert_eq!(value["conditions"][0]["type"], "Ready");
        assert_eq!(value["conditions"][0]["status"], "True");
    }

    #[test]
    fn phases_round_trip_through_strings() {
        assert_eq!(JobPhase::from_str("Succeeded"), Ok(JobPhase::Succeeded));
        assert_eq!(JobPhase::Running.to_string(), "Running");
        assert_eq!(EndpointPhase::from_str("Ready"), Ok(EndpointPhase::Ready));
        assert!(FunctionPhase::from_str("bogus").is_err());
    }
}
