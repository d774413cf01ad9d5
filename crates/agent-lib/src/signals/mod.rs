//! Health-signal batching for the v2 scaler algorithm
//!
//! Ring-buffers ELU, heap and custom signals per (service, signal, worker)
//! and flushes them to the control center on a short or long timeout. Alerts
//! returned by a flush become CPU profile requests.

mod batcher;

pub use batcher::{SignalsBatcher, SignalsWorker};
