//! Profile session management and flamegraph upload
//!
//! This module provides:
//! - One profiler task per (service, profile type) with request coalescing
//! - Pause windows that drop incoming requests for a service
//! - The upload sink binding produced profiles to their alerts

mod controller;
mod profiler;
mod uploader;

pub use controller::{run_states_reporter, ProfilingController};
pub use profiler::{ProducedProfile, ProfilerHandle};
pub use uploader::ProfileUploader;

use crate::models::ProfileType;

/// A request for profiling work, raised by the signals batcher, the alert
/// engine or the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileTrigger {
    Service {
        service_id: String,
        profile_type: ProfileType,
        alert_id: Option<String>,
    },
    AllServices {
        profile_type: ProfileType,
    },
}
