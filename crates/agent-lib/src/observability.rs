//! Observability infrastructure for the ICC agent
//!
//! Provides:
//! - Prometheus metrics for the four control loops
//! - Structured lifecycle logging with tracing

use prometheus::{
    register_histogram, register_int_gauge, register_int_gauge_vec, Histogram, IntGauge,
    IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for request latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    health_events: IntGauge,
    scaling_decisions: IntGaugeVec,
    signal_batches: IntGauge,
    alerts_posted: IntGauge,
    profiles_uploaded: IntGauge,
    profile_requests_dropped: IntGauge,
    control_reconnects: IntGauge,
    active_profilers: IntGauge,
    signals_post_latency_seconds: Histogram,
    upload_latency_seconds: Histogram,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            health_events: register_int_gauge!(
                "icc_agent_health_events_total",
                "Total number of worker health samples observed"
            )
            .expect("Failed to register health_events_total"),

            scaling_decisions: register_int_gauge_vec!(
                "icc_agent_scaling_decisions_total",
                "Total number of scaling recommendations applied",
                &["direction"]
            )
            .expect("Failed to register scaling_decisions_total"),

            signal_batches: register_int_gauge!(
                "icc_agent_signal_batches_total",
                "Total number of health-signal batches flushed to the control center"
            )
            .expect("Failed to register signal_batches_total"),

            alerts_posted: register_int_gauge!(
                "icc_agent_alerts_posted_total",
                "Total number of alerts posted to the control center"
            )
            .expect("Failed to register alerts_posted_total"),

            profiles_uploaded: register_int_gauge!(
                "icc_agent_profiles_uploaded_total",
                "Total number of flamegraphs uploaded"
            )
            .expect("Failed to register profiles_uploaded_total"),

            profile_requests_dropped: register_int_gauge!(
                "icc_agent_profile_requests_dropped_total",
                "Profile requests dropped while profiling was paused"
            )
            .expect("Failed to register profile_requests_dropped_total"),

            control_reconnects: register_int_gauge!(
                "icc_agent_control_reconnects_total",
                "Total number of control channel reconnection attempts"
            )
            .expect("Failed to register control_reconnects_total"),

            active_profilers: register_int_gauge!(
                "icc_agent_active_profilers",
                "Number of profilers currently registered"
            )
            .expect("Failed to register active_profilers"),

            signals_post_latency_seconds: register_histogram!(
                "icc_agent_signals_post_latency_seconds",
                "Time spent posting a health-signal batch",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register signals_post_latency_seconds"),

            upload_latency_seconds: register_histogram!(
                "icc_agent_upload_latency_seconds",
                "Time spent uploading a flamegraph",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register upload_latency_seconds"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_health_events(&self) {
        self.inner().health_events.inc();
    }

    pub fn inc_scaling_decisions(&self, direction: &str) {
        self.inner()
            .scaling_decisions
            .with_label_values(&[direction])
            .inc();
    }

    pub fn inc_signal_batches(&self) {
        self.inner().signal_batches.inc();
    }

    pub fn inc_alerts_posted(&self) {
        self.inner().alerts_posted.inc();
    }

    pub fn inc_profiles_uploaded(&self) {
        self.inner().profiles_uploaded.inc();
    }

    /// Requests dropped inside a pause window; kept visible so the policy of
    /// not retrying them can be revisited from dashboards.
    pub fn inc_profile_requests_dropped(&self) {
        self.inner().profile_requests_dropped.inc();
    }

    pub fn inc_control_reconnects(&self) {
        self.inner().control_reconnects.inc();
    }

    pub fn set_active_profilers(&self, count: i64) {
        self.inner().active_profilers.set(count);
    }

    pub fn observe_signals_post_latency(&self, duration_secs: f64) {
        self.inner()
            .signals_post_latency_seconds
            .observe(duration_secs);
    }

    pub fn observe_upload_latency(&self, duration_secs: f64) {
        self.inner().upload_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for agent lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    pod_id: String,
}

impl StructuredLogger {
    pub fn new(pod_id: impl Into<String>) -> Self {
        Self {
            pod_id: pod_id.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, application_id: &str) {
        info!(
            event = "agent_started",
            pod = %self.pod_id,
            agent_version = %version,
            application_id = %application_id,
            "ICC agent started"
        );
    }

    /// Log that no control center is configured
    pub fn log_standalone(&self) {
        warn!(
            event = "standalone_mode",
            pod = %self.pod_id,
            "No control center url configured, running standalone; local scaling only"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            pod = %self.pod_id,
            reason = %reason,
            "ICC agent shutting down"
        );
    }
}
