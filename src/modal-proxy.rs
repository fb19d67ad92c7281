use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use modal_client::CredentialStore;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tracing::info;
use tunnel::{gateway, socks};

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "modal-proxy",
    about = "Outbound SOCKS5 proxy and authenticated HTTP gateway sidecar"
)]
struct Opts {
    #[structopt(
        long = "proxy-port",
        env = "PROXY_PORT",
        default_value = "1080",
        help = "Port the outbound proxy listens on"
    )]
    proxy_port: u16,

    #[structopt(
        long = "gateway-port",
        env = "GATEWAY_PORT",
        default_value = "8080",
        help = "Port the HTTP gateway listens on"
    )]
    gateway_port: u16,

    #[structopt(
        long = "secret-path",
        env = "MODAL_SECRET_PATH",
        default_value = "/etc/modal-secret",
        help = "Mount path of the Modal token secret"
    )]
    secret_path: PathBuf,

    #[structopt(
        long = "namespace",
        env = "POD_NAMESPACE",
        default_value = "default",
        help = "Namespace used to resolve ModalFunction resources"
    )]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let opts = Opts::from_args();
    let credentials = CredentialStore::load(&opts.secret_path).await?;
    Arc::clone(&credentials).spawn_reloader(Duration::from_secs(60));

    let kube = kube::Client::try_default().await?;
    let gateway = Arc::new(gateway::Gateway::new(
        kube,
        credentials,
        opts.namespace.clone(),
    )?);

    let listener = TcpListener::bind(("0.0.0.0", opts.proxy_port)).await?;
    info!(
        proxy_port = opts.proxy_port,
        gateway_port = opts.gateway_port,
        "Starting sidecar proxy"
    );

    tokio::select! {
        result = socks::serve(listener) => result,
        _ = gateway::serve(gateway, opts.gateway_port) => Ok(()),
        _ = operator::shutdown_signal() => {
            info!("Shutting down sidecar proxy");
            Ok(())
        }
    }
}
