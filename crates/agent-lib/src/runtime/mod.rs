//! Boundary to the application runtime
//!
//! The runtime hosts the workers. The agent observes their health through a
//! single broadcast stream and drives them through a small set of command
//! RPCs; no cached view of the worker set is authoritative.

use crate::error::CommandError;
use crate::models::{HealthSample, ProfileType, ResourceUpdate, WorkerId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Options for starting a profile session on a worker.
#[derive(Debug, Clone)]
pub struct ProfilingOptions {
    pub profile_type: ProfileType,
    pub duration_millis: u64,
    pub source_maps: bool,
}

/// A produced profile and the time it covers up to.
#[derive(Debug, Clone)]
pub struct ProfileChunk {
    pub bytes: Vec<u8>,
    /// Unix milliseconds of the moment the profile was produced.
    pub timestamp: i64,
}

/// Profiling activity reported by the runtime for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProfilingState {
    Inactive,
    Active,
}

/// Command surface of the application runtime.
///
/// All commands are synchronous from the caller's perspective but may fail;
/// failures carry a [`CommandError`] tag the caller can branch on.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Subscribe to the ordered stream of worker health samples. Every
    /// subscriber observes the same arrival order.
    fn health_events(&self) -> broadcast::Receiver<HealthSample>;

    /// Whether the runtime emits the richer health-metrics event (heap and
    /// custom signals, no precomputed unhealthy flag).
    fn supports_health_metrics(&self) -> bool;

    async fn start_profiling(
        &self,
        worker: &WorkerId,
        options: &ProfilingOptions,
    ) -> Result<(), CommandError>;

    async fn stop_profiling(
        &self,
        worker: &WorkerId,
        profile_type: ProfileType,
    ) -> Result<(), CommandError>;

    /// Fetch the most recently produced profile for the worker.
    async fn last_profile(
        &self,
        worker: &WorkerId,
        profile_type: ProfileType,
    ) -> Result<ProfileChunk, CommandError>;

    async fn profiling_state(
        &self,
        worker: &WorkerId,
        profile_type: ProfileType,
    ) -> Result<WorkerProfilingState, CommandError>;

    /// Live workers grouped by service, each group ordered by worker index.
    /// Read fresh on every use.
    async fn list_workers(&self) -> Result<BTreeMap<String, Vec<WorkerId>>, CommandError>;

    async fn update_applications_resources(
        &self,
        updates: &[ResourceUpdate],
    ) -> Result<(), CommandError>;

    /// Apply a configuration update pushed over the control channel.
    async fn apply_config_update(
        &self,
        topic: &str,
        data: serde_json::Value,
    ) -> Result<(), CommandError>;

    /// Final shutdown of the adapter.
    async fn close(&self) -> Result<(), CommandError>;
}
