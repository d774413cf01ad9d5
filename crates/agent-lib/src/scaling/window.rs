//! Rolling ELU windows
//!
//! Keeps per-application, per-worker `(timestamp, elu)` samples inside the
//! configured time window. Entries age out lazily on insertion and read.

use crate::models::{HealthSample, WorkerId};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Per-application rolling ELU state.
pub struct EluWindows {
    window_ms: i64,
    apps: HashMap<String, HashMap<WorkerId, VecDeque<(i64, f64)>>>,
}

impl EluWindows {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            apps: HashMap::new(),
        }
    }

    /// Record one sample, expiring entries that fell out of the window.
    pub fn record(&mut self, sample: &HealthSample) {
        let buffer = self
            .apps
            .entry(sample.worker.service_id.clone())
            .or_default()
            .entry(sample.worker.clone())
            .or_default();

        buffer.push_back((sample.timestamp, sample.elu));
        expire(buffer, sample.timestamp - self.window_ms);
    }

    /// Mean across workers of each worker's mean ELU inside the window,
    /// rounded to two decimals. `None` when no worker has current samples.
    pub fn app_elu(&mut self, application_id: &str, now_ms: i64) -> Option<f64> {
        let workers = self.apps.get_mut(application_id)?;
        let cutoff = now_ms - self.window_ms;

        let mut worker_means = Vec::new();
        workers.retain(|_, buffer| {
            expire(buffer, cutoff);
            if buffer.is_empty() {
                return false;
            }
            let sum: f64 = buffer.iter().map(|(_, elu)| elu).sum();
            worker_means.push(sum / buffer.len() as f64);
            true
        });

        if worker_means.is_empty() {
            self.apps.remove(application_id);
            return None;
        }

        let mean = worker_means.iter().sum::<f64>() / worker_means.len() as f64;
        Some(round2(mean))
    }
}

fn expire(buffer: &mut VecDeque<(i64, f64)>, cutoff: i64) {
    while let Some((timestamp, _)) = buffer.front() {
        if *timestamp <= cutoff {
            buffer.pop_front();
        } else {
            break;
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
