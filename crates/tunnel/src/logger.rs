//! Log streamer
//!
//! Runs as the stand-in pod's primary container. Waits for the sibling
//! resource to carry a remote app id, then attaches to the backend log
//! stream and emits one JSON record per line to stdout. When the stream
//! ends it sleeps forever: the pod's death would read as workload failure
//! to whatever controller owns it.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use kube::Api;
use modal_client::ModalApi;
use operator::crd::{ModalEndpoint, ModalJob};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Poll interval while waiting for the sibling resource.
const RESOURCE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What the logger needs to know about its pod.
#[derive(Clone, Debug)]
pub struct LoggerConfig {
    /// Name of the stand-in pod (the sibling resource is `<pod>-modal`)
    pub pod_name: String,
    /// Namespace of the pod and its sibling resource
    pub namespace: String,
}

/// One structured log record, one per emitted line.
#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    pod: &'a str,
    container: &'static str,
    message: &'a str,
}

/// Stream the remote app's logs to stdout, then keep the pod alive.
pub async fn run(
    client: kube::Client,
    modal: Arc<dyn ModalApi>,
    config: LoggerConfig,
) -> anyhow::Result<()> {
    info!(pod = %config.pod_name, "Modal execution logger starting");
    if let Ok(images) = std::env::var("ORIGINAL_IMAGES") {
        info!(%images, "Original containers");
    }

    let resource = format!("{}-modal", config.pod_name);
    let (app_id, endpoint_url) = wait_for_resource(&client, &config.namespace, &resource).await;
    info!(%app_id, "Found Modal app for pod");
    if let Some(url) = endpoint_url {
        info!(%url, "HTTP endpoint is serving");
    }

    match modal.stream_app_logs(&app_id).await {
        Ok(mut stream) => {
            let stdout = std::io::stdout();
            while let Some(line) = stream.next().await {
                match line {
                    Ok(message) => {
                        let record = LogRecord {
                            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                            pod: &config.pod_name,
                            container: "modal",
                            message: &message,
                        };
                        let mut out = stdout.lock();
                        writeln!(out, "{}", serde_json::to_string(&record)?)?;
                        out.flush()?;
                    }
                    Err(e) => {
                        error!(error = %e, "Log stream failed");
                        break;
                    }
                }
            }
            info!("Modal app completed");
        }
        Err(e) => error!(error = %e, %app_id, "Could not open log stream"),
    }

    // Outlive the stream; workload controllers interpret container exit
    // as job completion or failure.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

/// Poll for the sibling resource (job first, then endpoint) until one of
/// them carries a remote app id.
async fn wait_for_resource(
    client: &kube::Client,
    namespace: &str,
    name: &str,
) -> (String, Option<String>) {
    info!(%name, "Waiting for Modal resource");
    let jobs: Api<ModalJob> = Api::namespaced(client.clone(), namespace);
    let endpoints: Api<ModalEndpoint> = Api::namespaced(client.clone(), namespace);
    loop {
        match jobs.get(name).await {
            Ok(job) => {
                if let Some(app_id) = job.status.and_then(|s| s.remote_app_id) {
                    return (app_id, None);
                }
            }
            Err(e) if is_not_found(&e) => debug!(%name, "No ModalJob yet"),
            Err(e) => warn!(error = %e, "ModalJob lookup failed"),
        }

        match endpoints.get(name).await {
            Ok(endpoint) => {
                if let Some(status) = endpoint.status {
                    if let Some(app_id) = status.remote_app_id {
                        return (app_id, status.endpoint_url);
                    }
                }
            }
            Err(e) if is_not_found(&e) => debug!(%name, "No ModalEndpoint yet"),
            Err(e) => warn!(error = %e, "ModalEndpoint lookup failed"),
        }

        tokio::time::sleep(RESOURCE_POLL_INTERVAL).await;
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(
        err,
        kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })
    )
}
