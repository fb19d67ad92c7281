use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use modal_client::{CredentialStore, MockClient, ModalApi};
use structopt::StructOpt;
use tunnel::logger::{self, LoggerConfig};

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "modal-logger",
    about = "Streams Modal app logs into the stand-in pod's stdout"
)]
struct Opts {
    #[structopt(
        long = "pod-name",
        env = "POD_NAME",
        help = "Name of the stand-in pod this logger runs in"
    )]
    pod_name: String,

    #[structopt(
        long = "namespace",
        env = "POD_NAMESPACE",
        default_value = "default",
        help = "Namespace of the pod and its sibling resource"
    )]
    namespace: String,

    #[structopt(
        long = "secret-path",
        env = "MODAL_SECRET_PATH",
        default_value = "/etc/modal-secret",
        help = "Mount path of the Modal token secret"
    )]
    secret_path: PathBuf,

    #[structopt(long = "mock", help = "Use the mock backend (also MODAL_MOCK=true)")]
    mock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let opts = Opts::from_args();
    let mock = opts.mock
        || std::env::var("MODAL_MOCK")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

    let modal: Arc<dyn ModalApi> = if mock {
        Arc::new(MockClient::new())
    } else {
        let credentials = CredentialStore::load(&opts.secret_path).await?;
        Arc::clone(&credentials).spawn_reloader(Duration::from_secs(60));
        Arc::new(modal_client::Client::new(credentials)?)
    };

    let client = kube::Client::try_default().await?;
    logger::run(
        client,
        modal,
        LoggerConfig {
            pod_name: opts.pod_name,
            namespace: opts.namespace,
        },
    )
    .await
}
