//! Process wiring
//!
//! One `Operator` value owns the Kubernetes client, the backend client
//! and the metrics registry, and starts every long-lived subsystem as a
//! spawned task. Subsystems communicate only through Kubernetes objects,
//! so there is nothing to lock between them. Shutdown is signal driven:
//! SIGINT/SIGTERM aborts the tasks and drains them within a bounded
//! window.

use std::sync::Arc;
use std::time::Duration;

use modal_client::{CredentialStore, MockClient, ModalApi};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use warp::Filter;

use crate::config::Config;
use crate::controllers::{EndpointController, FunctionController, JobController};
use crate::metrics::Metrics;
use crate::podwatch::PodWatcher;
use crate::status_sync;
use crate::trainjob::TrainJobWatcher;
use crate::webhook::{self, MutationConfig, WebhookConfig};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);
const CREDENTIAL_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled operator process.
pub struct Operator {
    client: kube::Client,
    modal: Arc<dyn ModalApi>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl Operator {
    /// Build an operator against the ambient cluster configuration.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let client = kube::Client::try_default().await?;
        Self::with_client(client, config).await
    }

    /// Build an operator against an explicit client (used in tests).
    pub async fn with_client(client: kube::Client, config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let modal: Arc<dyn ModalApi> = if config.mock {
            info!("Running against the mock Modal backend");
            Arc::new(MockClient::new())
        } else {
            // Missing credentials are fatal here; runtime rotation gaps are
            // handled by the reloader keeping the previous pair active.
            let store = CredentialStore::load(&config.secret_path).await?;
            Arc::clone(&store).spawn_reloader(CREDENTIAL_RELOAD_INTERVAL);
            Arc::new(modal_client::Client::new(store)?)
        };
        Ok(Operator {
            client,
            modal,
            metrics,
            config,
        })
    }

    /// The backend client handle (shared with the sidecars in tests).
    pub fn backend(&self) -> Arc<dyn ModalApi> {
        Arc::clone(&self.modal)
    }

    /// Start every subsystem and run until a shutdown signal arrives.
    pub async fn start(self) -> anyhow::Result<()> {
        self.metrics.record_operator_restart();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if self.config.enable_webhook {
            let webhook_config = WebhookConfig {
                addr: self.config.webhook_addr,
                port: self.config.webhook_port,
                cert_path: self.config.cert_path.clone(),
                key_path: self.config.key_path.clone(),
                mutation: MutationConfig {
                    operator_image: self.config.operator_image.clone(),
                    secret_name: self.config.secret_name.clone(),
                },
            };
            let metrics = Arc::clone(&self.metrics);
            tasks.push((
                "webhook",
                tokio::spawn(async move {
                    if let Err(e) = webhook::start(webhook_config, metrics).await {
                        error!(error = %e, "Admission webhook exited");
                    }
                }),
            ));
        }

        let jobs = JobController::new(
            self.client.clone(),
            Arc::clone(&self.modal),
            Arc::clone(&self.metrics),
        );
        tasks.push(("job-controller", tokio::spawn(jobs.run())));

        let functions = FunctionController::new(
            self.client.clone(),
            Arc::clone(&self.modal),
            Arc::clone(&self.metrics),
        );
        tasks.push(("function-controller", tokio::spawn(functions.run())));

        let endpoints = EndpointController::new(
            self.client.clone(),
            Arc::clone(&self.modal),
            Arc::clone(&self.metrics),
        );
        tasks.push(("endpoint-controller", tokio::spawn(endpoints.run())));

        let pods = PodWatcher::new(self.client.clone(), Arc::clone(&self.metrics));
        tasks.push(("pod-watcher", tokio::spawn(pods.run())));

        let trainjobs = TrainJobWatcher::new(self.client.clone(), Arc::clone(&self.metrics));
        tasks.push(("trainjob-watcher", tokio::spawn(trainjobs.run())));

        tasks.push((
            "status-sync",
            tokio::spawn(status_sync::run(
                self.client.clone(),
                Arc::clone(&self.metrics),
            )),
        ));

        tasks.push((
            "health",
            spawn_health_server(self.config.health_port),
        ));
        tasks.push((
            "metrics",
            spawn_metrics_server(Arc::clone(&self.metrics), self.config.metrics_port),
        ));

        info!(
            subsystems = tasks.len(),
            mock = self.config.mock,
            "Modal operator started"
        );

        shutdown_signal().await;
        info!("Shutting down, draining subsystems");
        for (_, handle) in &tasks {
            handle.abort();
        }
        let drain = futures::future::join_all(tasks.into_iter().map(|(_, handle)| handle));
        if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            warn!("Subsystems did not drain within the shutdown window");
        }
        Ok(())
    }
}

/// Liveness endpoint: plaintext `GET /healthz`.
fn spawn_health_server(port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let route = warp::get().and(warp::path("healthz")).map(|| "ok");
        info!(port, "Serving liveness endpoint");
        warp::serve(route).run(([0, 0, 0, 0], port)).await;
    })
}

/// Prometheus text endpoint: `GET /metrics`.
fn spawn_metrics_server(metrics: Arc<Metrics>, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let route = warp::get().and(warp::path("metrics")).map(move || {
            warp::reply::with_header(
                metrics.gather(),
                "content-type",
                "text/plain; version=0.0.4",
            )
        });
        info!(port, "Serving metrics endpoint");
        warp::serve(route).run(([0, 0, 0, 0], port)).await;
    })
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    }
}
