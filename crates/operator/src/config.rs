//! Operator configuration
//!
//! Built once in `main` and handed down; nothing below this reads the
//! environment on its own. The CLI surface (behind the `cli` feature)
//! mirrors the environment variables the chart sets.

use std::net::IpAddr;
use std::path::PathBuf;

#[cfg(feature = "cli")]
use structopt::StructOpt;

/// Everything the operator process needs to know at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Use the deterministic mock backend instead of the wire client
    pub mock: bool,
    /// Image the mutated pods run for their logger and proxy containers
    pub operator_image: String,
    /// Name of the secret mounted into mutated pods
    pub secret_name: String,
    /// Mount path of the operator's own credential secret
    pub secret_path: PathBuf,
    /// Whether to serve the admission webhook
    pub enable_webhook: bool,
    /// Webhook listen address
    pub webhook_addr: IpAddr,
    /// Webhook listen port
    pub webhook_port: u16,
    /// Webhook TLS certificate path
    pub cert_path: PathBuf,
    /// Webhook TLS private key path
    pub key_path: PathBuf,
    /// Liveness endpoint port
    pub health_port: u16,
    /// Prometheus endpoint port
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mock: false,
            operator_image: "ghcr.io/modal-operator/modal-operator:latest".to_owned(),
            secret_name: "modal-token".to_owned(),
            secret_path: PathBuf::from(modal_client::credentials::DEFAULT_SECRET_PATH),
            enable_webhook: true,
            webhook_addr: "0.0.0.0".parse().expect("hardcoded address parses"),
            webhook_port: 8443,
            cert_path: PathBuf::from("/etc/certs/tls.crt"),
            key_path: PathBuf::from("/etc/certs/tls.key"),
            health_port: 8080,
            metrics_port: 8081,
        }
    }
}

impl Config {
    /// Parse command line flags and environment into a config.
    #[cfg(feature = "cli")]
    pub fn new_from_flags() -> Self {
        let opts = Opts::from_args();
        let mock = opts.mock
            || std::env::var("MODAL_MOCK")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false);
        let enable_webhook = std::env::var("ENABLE_WEBHOOK")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(!opts.disable_webhook);
        Config {
            mock,
            operator_image: opts.operator_image,
            secret_name: opts.secret_name,
            secret_path: opts.secret_path,
            enable_webhook,
            webhook_addr: opts.webhook_addr,
            webhook_port: opts.webhook_port,
            cert_path: opts.cert_path,
            key_path: opts.key_path,
            health_port: opts.health_port,
            metrics_port: opts.metrics_port,
        }
    }
}

// Opts contains the values that can be configured for the operator
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
#[structopt(
    name = "modal-operator",
    about = "Runs Kubernetes GPU workloads on the Modal serverless backend"
)]
pub struct Opts {
    #[structopt(
        long = "mock",
        help = "Use the deterministic mock backend client (also MODAL_MOCK=true)"
    )]
    mock: bool,

    #[structopt(
        long = "operator-image",
        env = "OPERATOR_IMAGE",
        default_value = "ghcr.io/modal-operator/modal-operator:latest",
        help = "Image mutated pods run for their logger and proxy containers"
    )]
    operator_image: String,

    #[structopt(
        long = "secret-name",
        env = "MODAL_SECRET_NAME",
        default_value = "modal-token",
        help = "Name of the Modal token secret mounted into mutated pods"
    )]
    secret_name: String,

    #[structopt(
        long = "secret-path",
        env = "MODAL_SECRET_PATH",
        default_value = "/etc/modal-secret",
        help = "Mount path of the operator's Modal token secret"
    )]
    secret_path: PathBuf,

    #[structopt(long = "disable-webhook", help = "Do not serve the admission webhook")]
    disable_webhook: bool,

    #[structopt(
        long = "webhook-addr",
        default_value = "0.0.0.0",
        help = "Address the admission webhook listens on"
    )]
    webhook_addr: IpAddr,

    #[structopt(
        long = "webhook-port",
        env = "WEBHOOK_PORT",
        default_value = "8443",
        help = "Port the admission webhook listens on"
    )]
    webhook_port: u16,

    #[structopt(
        long = "cert-path",
        env = "WEBHOOK_CERT_PATH",
        default_value = "/etc/certs/tls.crt",
        help = "Webhook TLS certificate"
    )]
    cert_path: PathBuf,

    #[structopt(
        long = "key-path",
        env = "WEBHOOK_KEY_PATH",
        default_value = "/etc/certs/tls.key",
        help = "Webhook TLS private key"
    )]
    key_path: PathBuf,

    #[structopt(
        long = "health-port",
        default_value = "8080",
        help = "Port of the plaintext liveness endpoint"
    )]
    health_port: u16,

    #[structopt(
        long = "metrics-port",
        default_value = "8081",
        help = "Port of the Prometheus text endpoint"
    )]
    metrics_port: u16,
}
