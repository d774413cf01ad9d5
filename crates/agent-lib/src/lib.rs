//! ICC sidecar agent library
//!
//! This crate provides the core functionality for:
//! - Vertical autoscaling from event-loop-utilization samples
//! - Health-signal batching for the remote scaler algorithm
//! - CPU/heap profile sessions with flamegraph upload
//! - The persistent control channel to the Infrastructure Control Center

pub mod agent;
pub mod alerts;
pub mod error;
pub mod health;
pub mod icc;
pub mod models;
pub mod observability;
pub mod profiling;
pub mod runtime;
pub mod scaling;
pub mod settings;
pub mod signals;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CommandError, IccError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use settings::AgentSettings;
