//! Mutating admission webhook
//!
//! A TLS warp server answering `POST /mutate` with the standard admission
//! review envelope. Scoping to pods that want mutation happens at webhook
//! registration; everything that arrives here is rewritten. Each review is
//! pure over its payload (no API calls, no shared mutable state), so the
//! server can answer well inside the admission deadline.

mod mutate;

pub use mutate::{mutate, MutationConfig, MutationError};

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use warp::Filter;

use crate::metrics::Metrics;

/// Where and how the webhook listens.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Listen address, `0.0.0.0` in-cluster
    pub addr: IpAddr,
    /// Listen port, conventionally 8443
    pub port: u16,
    /// PEM certificate path
    pub cert_path: PathBuf,
    /// PEM private key path
    pub key_path: PathBuf,
    /// Parameters of the mutation itself
    pub mutation: MutationConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionReview {
    api_version: String,
    kind: String,
    request: AdmissionRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionRequest {
    uid: Option<String>,
    #[serde(default)]
    object: Option<Pod>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionReviewResponse {
    api_version: String,
    kind: String,
    response: AdmissionResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionResponse {
    uid: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ResponseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch_type: Option<String>,
}

#[derive(Serialize)]
struct ResponseStatus {
    message: String,
}

/// Review one admission request, producing either a JSONPatch or a denial.
#[instrument(level = "info", skip(review, config, metrics), fields(uid = %review.request.uid.as_deref().unwrap_or("")))]
fn review_pod(
    review: AdmissionReview,
    config: &MutationConfig,
    metrics: &Metrics,
) -> AdmissionReviewResponse {
    let uid = review.request.uid.clone().unwrap_or_default();

    let response = match &review.request.object {
        None => {
            metrics.record_webhook_request("POST", "error");
            deny(uid, "admission request carried no pod object".to_owned())
        }
        Some(pod) => match mutate(pod, config) {
            Ok(patch) => {
                let name = pod.metadata.name.as_deref().unwrap_or("unknown");
                info!(pod = %name, ops = patch.0.len(), "Mutated pod for Modal execution");
                metrics.record_webhook_request("POST", "mutated");
                let encoded = base64::encode(
                    serde_json::to_vec(&patch).expect("patch operations serialize"),
                );
                AdmissionResponse {
                    uid,
                    allowed: true,
                    status: Some(ResponseStatus {
                        message: "Mutated pod for Modal execution".to_owned(),
                    }),
                    patch: Some(encoded),
                    patch_type: Some("JSONPatch".to_owned()),
                }
            }
            Err(e) => {
                warn!(error = %e, "Denying admission of structurally invalid pod");
                metrics.record_webhook_request("POST", "denied");
                deny(uid, format!("Mutation failed: {}", e))
            }
        },
    };

    AdmissionReviewResponse {
        api_version: review.api_version,
        kind: review.kind,
        response,
    }
}

fn deny(uid: String, message: String) -> AdmissionResponse {
    AdmissionResponse {
        uid,
        allowed: false,
        status: Some(ResponseStatus { message }),
        patch: None,
        patch_type: None,
    }
}

/// Serve the webhook until the process shuts down.
pub async fn start(config: WebhookConfig, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let mutation = Arc::new(config.mutation.clone());
    let route = warp::post()
        .and(warp::path("mutate"))
        .and(warp::body::json())
        .map(move |review: AdmissionReview| {
            warp::reply::json(&review_pod(review, &mutation, &metrics))
        });

    info!(port = config.port, "Starting admission webhook");
    warp::serve(route)
        .tls()
        .cert_path(&config.cert_path)
        .key_path(&config.key_path)
        .run((config.addr, config.port))
        .await;
    Ok(())
}
