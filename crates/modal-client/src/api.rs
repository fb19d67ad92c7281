//! The capability set the operator needs from the backend

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;

/// A line-oriented stream of log output from a remote app.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// One replica of a job submission. Single jobs have exactly one task with
/// rank 0; distributed jobs carry one task per replica with `{rank}` and
/// `{worldSize}` tokens already substituted into the argv and `RANK` /
/// `WORLD_SIZE` present in the env.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobTask {
    /// Zero-based replica rank
    pub rank: u32,
    /// Total replica count
    pub world_size: u32,
    /// Entrypoint command
    pub command: Vec<String>,
    /// Arguments to the command
    pub args: Vec<String>,
    /// Environment for this replica
    pub env: BTreeMap<String, String>,
}

/// A fully translated batch job submission.
#[derive(Clone, Debug, Serialize)]
pub struct JobRequest {
    /// Remote app name
    pub name: String,
    /// Container image to run, byte-exact as the user wrote it
    pub image: String,
    /// CPU allocation as a decimal string, e.g. "0.25"
    pub cpu: String,
    /// Memory allocation in MiB
    pub memory_mib: u64,
    /// GPU specification such as "T4:1", if any
    pub gpu: Option<String>,
    /// Job timeout in seconds
    pub timeout_seconds: u32,
    /// Retry budget
    pub retries: u32,
    /// Whether the replicas share the backend's private network
    pub cluster_networking: bool,
    /// One entry per replica
    pub tasks: Vec<JobTask>,
}

/// A deployed callable function.
#[derive(Clone, Debug, Serialize)]
pub struct FunctionRequest {
    /// Remote app name
    pub name: String,
    /// Container image for the function
    pub image: String,
    /// Dotted handler path resolved in the remote environment
    pub handler: String,
    /// CPU allocation as a decimal string
    pub cpu: String,
    /// Memory allocation in MiB
    pub memory_mib: u64,
    /// GPU specification, if any
    pub gpu: Option<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Per-call timeout in seconds
    pub timeout_seconds: u32,
    /// Maximum concurrent executions
    pub concurrency: u32,
}

/// A long-lived HTTP endpoint deployment.
#[derive(Clone, Debug, Serialize)]
pub struct EndpointRequest {
    /// Remote deployment name (the reconciler appends `-endpoint`)
    pub name: String,
    /// Container image
    pub image: String,
    /// Handler path; ignored when a command is given
    pub handler: String,
    /// Command wrapped behind the HTTP endpoint, if any
    pub command: Vec<String>,
    /// Arguments to the command
    pub args: Vec<String>,
    /// CPU allocation as a decimal string
    pub cpu: String,
    /// Memory allocation in MiB
    pub memory_mib: u64,
    /// GPU specification, if any
    pub gpu: Option<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Autoscaling floor
    pub min_replicas: u32,
    /// Autoscaling ceiling
    pub max_replicas: u32,
}

/// Result of a successful job submission.
#[derive(Clone, Debug, Deserialize)]
pub struct JobCreated {
    /// Backend-assigned app id
    pub app_id: String,
    /// Id of the spawned function call (rank 0 for distributed jobs)
    pub function_id: String,
    /// Tunnel URL back into the cluster, when requested
    pub tunnel_url: Option<String>,
}

/// Result of a successful function deployment.
#[derive(Clone, Debug, Deserialize)]
pub struct FunctionDeployed {
    /// Backend-assigned app id
    pub app_id: String,
    /// Invocation URL
    pub function_url: String,
}

/// Result of a successful endpoint deployment.
#[derive(Clone, Debug, Deserialize)]
pub struct EndpointDeployed {
    /// Backend-assigned app id
    pub app_id: String,
    /// Public HTTPS URL of the endpoint
    pub endpoint_url: String,
}

/// Remote lifecycle state of an app.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Submitted but not yet running
    Pending,
    /// Executing
    Running,
    /// Finished without error
    Succeeded,
    /// Finished with an error
    Failed,
    /// Stopped by request
    Stopped,
}

impl AppState {
    /// Whether the app has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppState::Succeeded | AppState::Failed | AppState::Stopped)
    }
}

/// Point-in-time status of a remote app.
#[derive(Clone, Debug, Deserialize)]
pub struct AppStatus {
    /// Lifecycle state
    pub state: AppState,
    /// Exit code of the primary task, once terminal
    pub exit_code: Option<i32>,
    /// Human-readable detail
    pub message: Option<String>,
    /// GPU utilization in percent, reported while a GPU app runs
    #[serde(default)]
    pub gpu_utilization: Option<f64>,
}

/// A deployed app as reported by the backend listing call.
#[derive(Clone, Debug, Deserialize)]
pub struct DeployedApp {
    /// Backend-assigned app id
    pub app_id: String,
    /// Deployment name
    pub name: String,
}

/// The narrow backend capability set used by the operator.
///
/// Two implementations exist: [`crate::Client`] speaks the wire protocol,
/// [`crate::MockClient`] answers deterministically and never performs I/O.
#[async_trait]
pub trait ModalApi: Send + Sync {
    /// Submit a batch job. Distributed submissions spawn one remote call
    /// per task.
    async fn create_job(&self, req: &JobRequest) -> Result<JobCreated, BackendError>;

    /// Deploy a callable function.
    async fn create_function(&self, req: &FunctionRequest) -> Result<FunctionDeployed, BackendError>;

    /// Deploy a persistent HTTP endpoint.
    async fn create_endpoint(&self, req: &EndpointRequest) -> Result<EndpointDeployed, BackendError>;

    /// Fetch the current status of an app.
    async fn app_status(&self, app_id: &str) -> Result<AppStatus, BackendError>;

    /// Cancel a running job.
    async fn cancel_job(&self, app_id: &str, function_id: &str) -> Result<(), BackendError>;

    /// Stop and remove an app.
    async fn delete_app(&self, app_id: &str) -> Result<(), BackendError>;

    /// List currently deployed apps (used for orphan cleanup).
    async fn list_deployed_apps(&self) -> Result<Vec<DeployedApp>, BackendError>;

    /// Stream an app's log output as lines.
    async fn stream_app_logs(&self, app_id: &str) -> Result<LogStream, BackendError>;

    /// Read the per-replica address registry of a distributed job, keyed
    /// by rank. Entries may be missing while replicas are still starting;
    /// callers must tolerate partial results.
    async fn replica_addresses(
        &self,
        job_name: &str,
    ) -> Result<BTreeMap<u32, String>, BackendError>;
}
