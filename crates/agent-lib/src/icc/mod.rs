//! Infrastructure Control Center integration
//!
//! This module provides:
//! - An authenticated HTTP client for the signals, alerts and flamegraph
//!   endpoints
//! - The persistent control channel receiving configuration updates and
//!   trigger commands

mod client;
mod control;

pub use client::{
    AlertBody, AlertPayload, AuthProvider, BearerTokenProvider, ControlCenter, HealthSnapshot,
    IccClient, SignalOptions, SignalSeries, SignalsPayload, WorkerSeries,
};
pub use control::{ControlChannel, ControlEvent};
