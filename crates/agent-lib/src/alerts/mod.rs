//! Unhealthy-worker alerting for the v1 scaler algorithm
//!
//! Watches the health stream, rate-limits alerts per service, posts them to
//! the control center and turns the returned alert ids into CPU profile
//! requests. Sustained high ELU pauses profiling for the service.

mod engine;

pub use engine::AlertEngine;
