//! Core data models for the ICC agent

use serde::{Deserialize, Serialize};
use std::fmt;

/// One execution unit of an application, identified by `(serviceId, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId {
    pub service_id: String,
    pub index: u32,
}

impl WorkerId {
    pub fn new(service_id: impl Into<String>, index: u32) -> Self {
        Self {
            service_id: service_id.into(),
            index,
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.index)
    }
}

/// An extra signal attached to a health event by richer runtimes,
/// forwarded to the remote scaler verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomSignal {
    pub name: String,
    pub value: f64,
}

/// One health observation for a worker, emitted by the runtime adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub worker: WorkerId,
    /// Event loop utilization in `[0, 1]`.
    pub elu: f64,
    pub heap_used_bytes: u64,
    pub heap_total_bytes: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Present on the basic health event. Richer runtimes omit it and the
    /// alert engine synthesizes the verdict from ELU and heap usage.
    pub unhealthy: Option<bool>,
    #[serde(default)]
    pub health_signals: Vec<CustomSignal>,
}

/// Kind of signal tracked by the health-signals batcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignalType {
    Elu,
    Heap,
    Custom(String),
}

impl SignalType {
    /// Key used for this signal in the batch payload.
    pub fn key(&self) -> &str {
        match self {
            SignalType::Elu => "elu",
            SignalType::Heap => "heap",
            SignalType::Custom(name) => name,
        }
    }
}

/// Kind of profile a worker can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Cpu,
    Heap,
}

impl ProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Cpu => "cpu",
            ProfileType::Heap => "heap",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a scaling recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

/// Per-application input to the scaling algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct AppInfo {
    pub application_id: String,
    /// Mean across workers of each worker's mean ELU over the time window,
    /// rounded to two decimals.
    pub elu: f64,
    pub worker_count: u32,
}

/// Output of the scaling algorithm for one application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRecommendation {
    pub application_id: String,
    pub workers: u32,
    pub direction: ScaleDirection,
}

/// Requested worker-count change for one application, applied through the
/// runtime adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdate {
    pub application_id: String,
    pub workers: u32,
}

/// An alert handed back by the control center in a signals-batch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRef {
    pub service_id: String,
    pub worker_id: String,
    pub alert_id: String,
}

/// A queued request for a profile, optionally bound to an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRequest {
    pub alert_id: Option<String>,
    /// Unix milliseconds at which the request was made; a produced profile
    /// covers every request not newer than its own timestamp.
    pub timestamp: i64,
}

impl ProfileRequest {
    pub fn new(alert_id: Option<String>, timestamp: i64) -> Self {
        Self {
            alert_id,
            timestamp,
        }
    }

    /// A request stamped with the current wall clock.
    pub fn now(alert_id: Option<String>) -> Self {
        Self::new(alert_id, chrono::Utc::now().timestamp_millis())
    }
}

/// Lifecycle phase of a profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfilerPhase {
    Idle,
    Running,
    Stopping,
}

/// Snapshot of one profiler, reported to the control center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerState {
    pub service_id: String,
    pub profile_type: ProfileType,
    pub worker_id: String,
    pub phase: ProfilerPhase,
}
