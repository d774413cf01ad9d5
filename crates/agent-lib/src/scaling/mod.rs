//! Vertical autoscaling from event-loop-utilization samples
//!
//! This module provides:
//! - Rolling per-worker ELU windows
//! - The pure scale recommendation algorithm
//! - The controller serializing decisions behind a cooldown

mod algorithm;
mod controller;
mod window;

pub use algorithm::{recommend, ScalerOptions};
pub use controller::ScalingController;
pub use window::EluWindows;
