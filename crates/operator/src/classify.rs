//! Workload-shape detection
//!
//! Decides whether a pod becomes a batch job or a function on the backend,
//! using an ordered rule set over the original command line and image. The
//! rules are evaluated first-match-wins and never re-ordered; ambiguity is
//! reported at debug level only.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::annotations;

/// Command-line tokens that indicate a long-lived service.
const SERVICE_TOKENS: &[&str] = &["serve", "server", "api", "8080", "5000"];

/// Command-line tokens that indicate batch execution.
const BATCH_TOKENS: &[&str] = &["train", "batch", "process", "run"];

/// Image substrings that indicate a serving workload.
const SERVICE_IMAGES: &[&str] = &["torchserve", "api"];

/// The two workload shapes a pod can classify as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadType {
    /// One-shot batch execution
    Job,
    /// Request-serving workload
    Function,
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadType::Job => write!(f, "job"),
            WorkloadType::Function => write!(f, "function"),
        }
    }
}

impl FromStr for WorkloadType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(WorkloadType::Job),
            "function" => Ok(WorkloadType::Function),
            _ => Err(()),
        }
    }
}

/// The custom resource a classified workload is realised as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// `ModalJob`
    Job,
    /// `ModalFunction`
    Function,
    /// `ModalEndpoint`
    Endpoint,
}

/// Classify a workload from its capsule and annotations.
///
/// Rules, first match wins:
/// 1. an explicit `workload-type` annotation is taken verbatim;
/// 2. service tokens in the joined command line mean `function`;
/// 3. batch tokens mean `job`;
/// 4. a serving image substring means `function`;
/// 5. everything else is a `job`.
pub fn classify(
    images: &[String],
    commands: &[Vec<String>],
    args: &[Vec<String>],
    annotations: &BTreeMap<String, String>,
) -> WorkloadType {
    if let Some(requested) = annotations
        .get(annotations::WORKLOAD_TYPE)
        .and_then(|v| v.parse().ok())
    {
        return requested;
    }

    // Container index zero is canonical for command and args.
    let command_line = commands
        .first()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .chain(args.first().map(Vec::as_slice).unwrap_or_default())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");

    let service_hit = SERVICE_TOKENS.iter().find(|t| command_line.contains(**t));
    let batch_hit = BATCH_TOKENS.iter().find(|t| command_line.contains(**t));
    if let (Some(service), Some(batch)) = (service_hit, batch_hit) {
        debug!(
            winner = *service,
            shadowed = *batch,
            "Multiple classifier rules match; first rule wins"
        );
    }
    if service_hit.is_some() {
        return WorkloadType::Function;
    }
    if batch_hit.is_some() {
        return WorkloadType::Job;
    }

    if let Some(image) = images.first() {
        if SERVICE_IMAGES.iter().any(|t| image.contains(t)) {
            return WorkloadType::Function;
        }
    }

    WorkloadType::Job
}

/// Which custom resource to create for a classified workload.
///
/// A `function` with a command becomes an HTTP-wrapped `ModalEndpoint`; a
/// bare `function` becomes a `ModalFunction`.
pub fn resource_kind(workload: WorkloadType, has_command: bool) -> ResourceKind {
    match workload {
        WorkloadType::Job => ResourceKind::Job,
        WorkloadType::Function if has_command => ResourceKind::Endpoint,
        WorkloadType::Function => ResourceKind::Function,
    }
}
