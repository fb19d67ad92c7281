//! Prometheus metrics
//!
//! One `Metrics` value is created at startup and handed to every
//! subsystem; there is no global registry. Counter updates in the hot
//! path are atomic increments on pre-registered label vectors.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

const DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0,
];
const QUEUE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// The operator's metric set.
pub struct Metrics {
    registry: Registry,

    jobs_total: IntCounterVec,
    jobs_active: IntGaugeVec,
    job_duration: HistogramVec,
    job_queue_time: HistogramVec,
    replica_count: IntGaugeVec,
    cold_starts: IntCounterVec,
    errors_total: IntCounterVec,
    webhook_requests: IntCounterVec,
    operator_restarts: IntCounter,
    gpu_utilization: GaugeVec,
    cost_estimate: GaugeVec,

    start_times: Mutex<HashMap<String, Instant>>,
    queue_times: Mutex<HashMap<String, Instant>>,
}

impl Metrics {
    /// Build and register the full metric set on a fresh registry.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("modal_jobs_total", "Total number of Modal jobs"),
            &["status", "gpu_type", "replicas"],
        )?;
        let jobs_active = IntGaugeVec::new(
            Opts::new("modal_jobs_active", "Currently active Modal jobs"),
            &["gpu_type"],
        )?;
        let job_duration = HistogramVec::new(
            HistogramOpts::new("modal_job_duration_seconds", "Modal job duration in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["status", "gpu_type"],
        )?;
        let job_queue_time = HistogramVec::new(
            HistogramOpts::new(
                "modal_job_queue_seconds",
                "Time jobs spend queued before starting",
            )
            .buckets(QUEUE_BUCKETS.to_vec()),
            &["gpu_type"],
        )?;
        let replica_count = IntGaugeVec::new(
            Opts::new("modal_job_replicas", "Number of replicas per job"),
            &["job_name"],
        )?;
        let cold_starts = IntCounterVec::new(
            Opts::new(
                "modal_function_cold_starts_total",
                "Total function cold starts",
            ),
            &["job_name", "gpu_type"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("modal_operator_errors_total", "Total operator errors"),
            &["error_type", "component"],
        )?;
        let webhook_requests = IntCounterVec::new(
            Opts::new("modal_webhook_requests_total", "Total webhook requests"),
            &["method", "status"],
        )?;
        let operator_restarts = IntCounter::new(
            "modal_operator_restarts_total",
            "Total operator restarts",
        )?;
        let gpu_utilization = GaugeVec::new(
            Opts::new("modal_gpu_utilization", "GPU utilization by job"),
            &["job_name", "gpu_type"],
        )?;
        let cost_estimate = GaugeVec::new(
            Opts::new("modal_cost_estimate_usd", "Estimated cost in USD"),
            &["job_name", "gpu_type", "time_period"],
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(jobs_active.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(job_queue_time.clone()))?;
        registry.register(Box::new(replica_count.clone()))?;
        registry.register(Box::new(cold_starts.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(webhook_requests.clone()))?;
        registry.register(Box::new(operator_restarts.clone()))?;
        registry.register(Box::new(gpu_utilization.clone()))?;
        registry.register(Box::new(cost_estimate.clone()))?;

        Ok(Metrics {
            registry,
            jobs_total,
            jobs_active,
            job_duration,
            job_queue_time,
            replica_count,
            cold_starts,
            errors_total,
            webhook_requests,
            operator_restarts,
            gpu_utilization,
            cost_estimate,
            start_times: Mutex::new(HashMap::new()),
            queue_times: Mutex::new(HashMap::new()),
        })
    }

    /// Mark a job as queued, starting its queue-time clock.
    pub fn record_job_queued(&self, job_name: &str) {
        self.queue_times
            .lock()
            .unwrap()
            .insert(job_name.to_owned(), Instant::now());
    }

    /// Mark a job as started, observing its queue time.
    pub fn record_job_started(&self, job_name: &str, gpu_type: Option<&str>) {
        if let Some(queued) = self.queue_times.lock().unwrap().remove(job_name) {
            self.job_queue_time
                .with_label_values(&[gpu_label(gpu_type)])
                .observe(queued.elapsed().as_secs_f64());
        }
    }

    /// Record a successful job creation.
    pub fn record_job_created(&self, job_name: &str, gpu_type: Option<&str>, replicas: u32) {
        let gpu = gpu_label(gpu_type);
        self.jobs_total
            .with_label_values(&["created", gpu, &replicas.to_string()])
            .inc();
        self.jobs_active.with_label_values(&[gpu]).inc();
        self.replica_count
            .with_label_values(&[job_name])
            .set(replicas as i64);
        self.start_times
            .lock()
            .unwrap()
            .insert(job_name.to_owned(), Instant::now());
    }

    /// Record a job reaching a terminal state.
    pub fn record_job_completed(&self, job_name: &str, status: &str, gpu_type: Option<&str>) {
        let gpu = gpu_label(gpu_type);
        self.jobs_total.with_label_values(&[status, gpu, "1"]).inc();
        self.jobs_active.with_label_values(&[gpu]).dec();
        if let Some(started) = self.start_times.lock().unwrap().remove(job_name) {
            self.job_duration
                .with_label_values(&[status, gpu])
                .observe(started.elapsed().as_secs_f64());
        }
        self.replica_count.with_label_values(&[job_name]).set(0);
    }

    /// Record a function cold start.
    pub fn record_cold_start(&self, job_name: &str, gpu_type: &str) {
        self.cold_starts
            .with_label_values(&[job_name, gpu_type])
            .inc();
    }

    /// Record an operator error by type and component.
    pub fn record_error(&self, error_type: &str, component: &str) {
        self.errors_total
            .with_label_values(&[error_type, component])
            .inc();
    }

    /// Record one admission webhook request.
    pub fn record_webhook_request(&self, method: &str, status: &str) {
        self.webhook_requests
            .with_label_values(&[method, status])
            .inc();
    }

    /// Record an operator (re)start.
    pub fn record_operator_restart(&self) {
        self.operator_restarts.inc();
    }

    /// Update the GPU utilization gauge for a job.
    pub fn update_gpu_utilization(&self, job_name: &str, gpu_type: &str, utilization: f64) {
        self.gpu_utilization
            .with_label_values(&[job_name, gpu_type])
            .set(utilization);
    }

    /// Update the cost-estimate gauge for a job.
    pub fn update_cost_estimate(
        &self,
        job_name: &str,
        gpu_type: &str,
        time_period: &str,
        cost_usd: f64,
    ) {
        self.cost_estimate
            .with_label_values(&[job_name, gpu_type, time_period])
            .set(cost_usd);
    }

    /// Render the registry in the Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut out) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(out).unwrap_or_default()
    }
}

fn gpu_label(gpu_type: Option<&str>) -> &str {
    gpu_type.unwrap_or("none")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_lifecycle_counts() {
        let metrics = Metrics::new().expect("metrics build");
        metrics.record_job_queued("demo");
        metrics.record_job_created("demo", Some("T4"), 3);
        metrics.record_job_started("demo", Some("T4"));
        metrics.record_job_completed("demo", "completed", Some("T4"));

        let text = metrics.gather();
        assert!(text.contains(
            "modal_jobs_total{gpu_type=\"T4\",replicas=\"3\",status=\"created\"} 1"
        ));
        assert!(text.contains("modal_jobs_active{gpu_type=\"T4\"} 0"));
        assert!(text.contains("modal_job_replicas{job_name=\"demo\"} 0"));
    }

    #[test]
    fn webhook_and_error_counters() {
        let metrics = Metrics::new().expect("metrics build");
        metrics.record_webhook_request("POST", "mutated");
        metrics.record_webhook_request("POST", "denied");
        metrics.record_error("translation", "job_controller");

        let text = metrics.gather();
        assert!(text.contains(
            "modal_webhook_requests_total{method=\"POST\",status=\"mutated\"} 1"
        ));
        assert!(text.contains(
            "modal_operator_errors_total{component=\"job_controller\",error_type=\"translation\"} 1"
        ));
    }

    #[test]
    fn gpu_gauges_render_updates() {
        let metrics = Metrics::new().expect("metrics build");
        metrics.update_gpu_utilization("train", "T4", 82.5);
        metrics.update_cost_estimate("train", "T4", "total", 1.18);

        let text = metrics.gather();
        assert!(text.contains(
            "modal_gpu_utilization{gpu_type=\"T4\",job_name=\"train\"} 82.5"
        ));
        assert!(text.contains(
            "modal_cost_estimate_usd{gpu_type=\"T4\",job_name=\"train\",time_period=\"total\"} 1.18"
        ));
    }

    #[test]
    fn registries_are_independent() {
        // Two instances must not collide the way a global registry would.
        let first = Metrics::new().expect("first registry");
        let second = Metrics::new().expect("second registry");
        first.record_operator_restart();
        assert!(first.gather().contains("modal_operator_restarts_total 1"));
        assert!(second.gather().contains("modal_operator_restarts_total 0"));
    }
}
