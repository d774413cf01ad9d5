//! Alert detection and emission
//!
//! Keeps a rolling cache of recent health snapshots, suppresses alerts for
//! freshly started workers and for services that alerted recently, and posts
//! `{applicationId, alert, healthHistory}` bodies to the control center.

use crate::icc::{AlertBody, AlertPayload, ControlCenter, HealthSnapshot};
use crate::models::{HealthSample, ProfileRequest, ProfileType, WorkerId};
use crate::observability::AgentMetrics;
use crate::profiling::ProfilingController;
use crate::settings::{AlertSettings, FlamegraphSettings, HealthSettings};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// ELU above which a sample without a runtime verdict counts as unhealthy.
const SYNTHETIC_UNHEALTHY_ELU: f64 = 0.85;

pub struct AlertEngine {
    application_id: String,
    settings: AlertSettings,
    pause_elu_threshold: f64,
    pause_timeout: Duration,
    max_heap_used: f64,
    icc: Arc<dyn ControlCenter>,
    /// Absent when profiling is disabled; alerts are still posted.
    profiling: Option<Arc<ProfilingController>>,
    health_cache: VecDeque<HealthSnapshot>,
    first_seen: HashMap<WorkerId, i64>,
    last_alert_at: HashMap<String, i64>,
    metrics: AgentMetrics,
}

impl AlertEngine {
    pub fn new(
        application_id: impl Into<String>,
        settings: AlertSettings,
        health: &HealthSettings,
        flamegraphs: &FlamegraphSettings,
        icc: Arc<dyn ControlCenter>,
        profiling: Option<Arc<ProfilingController>>,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            settings,
            pause_elu_threshold: flamegraphs.pause_elu_threshold,
            pause_timeout: flamegraphs.pause_timeout(),
            max_heap_used: health.max_heap_used,
            icc,
            profiling,
            health_cache: VecDeque::new(),
            first_seen: HashMap::new(),
            last_alert_at: HashMap::new(),
            metrics,
        }
    }

    /// Process one health sample.
    pub async fn on_sample(&mut self, sample: &HealthSample) {
        let now = sample.timestamp;
        let unhealthy = self.is_unhealthy(sample);

        let snapshot = HealthSnapshot {
            worker_id: sample.worker.to_string(),
            elu: sample.elu,
            heap_used: sample.heap_used_bytes,
            heap_total: sample.heap_total_bytes,
            unhealthy,
            timestamp: now,
        };
        self.health_cache.push_back(snapshot.clone());
        let cutoff = now - self.settings.pod_health_window_ms as i64;
        while self
            .health_cache
            .front()
            .map(|entry| entry.timestamp < cutoff)
            .unwrap_or(false)
        {
            self.health_cache.pop_front();
        }

        let first_seen = *self.first_seen.entry(sample.worker.clone()).or_insert(now);

        // pause is evaluated for every hot sample, alert rate limiting aside
        if sample.elu >= self.pause_elu_threshold {
            if let Some(profiling) = &self.profiling {
                profiling
                    .pause_profiling(&sample.worker.service_id, self.pause_timeout)
                    .await;
            }
        }

        if !unhealthy {
            return;
        }
        if now - first_seen < self.settings.grace_period_ms() {
            debug!(worker = %sample.worker, "Worker inside grace period, suppressing alert");
            return;
        }

        let service_id = sample.worker.service_id.clone();
        if let Some(last) = self.last_alert_at.get(&service_id) {
            if now - last < self.settings.alert_retention_window_ms as i64 {
                debug!(service_id, "Alert for service raised recently, suppressing");
                return;
            }
        }
        self.last_alert_at.insert(service_id.clone(), now);

        let payload = AlertPayload {
            application_id: self.application_id.clone(),
            alert: AlertBody {
                id: local_alert_id(),
                application: self.application_id.clone(),
                service: service_id.clone(),
                current_health: snapshot,
                unhealthy: true,
                timestamp: now,
            },
            health_history: self.health_cache.iter().cloned().collect(),
        };

        match self.icc.post_alert(&payload).await {
            Ok(alert_id) => {
                self.metrics.inc_alerts_posted();
                info!(
                    service_id,
                    alert_id = %alert_id,
                    elu = sample.elu,
                    "Posted unhealthy-worker alert"
                );
                if let Some(profiling) = &self.profiling {
                    profiling
                        .request_profile(
                            &service_id,
                            ProfileType::Cpu,
                            ProfileRequest::new(Some(alert_id), now),
                        )
                        .await;
                }
            }
            Err(e) => {
                warn!(error = %e, service_id, "Failed to post alert");
            }
        }
    }

    fn is_unhealthy(&self, sample: &HealthSample) -> bool {
        sample.unhealthy.unwrap_or_else(|| {
            let heap_ratio = if sample.heap_total_bytes == 0 {
                0.0
            } else {
                sample.heap_used_bytes as f64 / sample.heap_total_bytes as f64
            };
            sample.elu > SYNTHETIC_UNHEALTHY_ELU || heap_ratio > self.max_heap_used
        })
    }

    /// Drain health events until shutdown.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<HealthSample>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            grace_period_sec = self.settings.grace_period_sec,
            retention_window_ms = self.settings.alert_retention_window_ms,
            "Starting alert engine"
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(sample) => self.on_sample(&sample).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Alert engine lagged behind health events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("Alert engine stopped");
    }
}

fn local_alert_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:x}{:x}", now.as_secs(), now.subsec_nanos())
}
