//! Signal batch assembly and flush cadence
//!
//! A batch opens with the first recorded sample. Every second the worker
//! checks its age: a batch that saw a value above the ELU or heap threshold
//! flushes on the short timeout, a quiet one on the long timeout. A new empty
//! batch opens immediately after a flush.

use crate::icc::{ControlCenter, SignalOptions, SignalSeries, SignalsPayload, WorkerSeries};
use crate::models::{HealthSample, ProfileType, SignalType};
use crate::observability::AgentMetrics;
use crate::profiling::ProfileTrigger;
use crate::settings::HealthSettings;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Default)]
struct ServiceSignals {
    /// Last observed heap total in MiB, reported with the heap series.
    heap_total_mib: Option<f64>,
    /// `signal kind -> workerId -> timestamped values`.
    series: BTreeMap<String, BTreeMap<String, VecDeque<(i64, f64)>>>,
}

struct OpenBatch {
    started_at: i64,
    hot: bool,
    services: BTreeMap<String, ServiceSignals>,
}

impl OpenBatch {
    fn new(started_at: i64) -> Self {
        Self {
            started_at,
            hot: false,
            services: BTreeMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ServiceSignals {
    fn push(&mut self, signal: &SignalType, worker: &str, entry: (i64, f64), cap: usize) {
        let buffer = self
            .series
            .entry(signal.key().to_string())
            .or_default()
            .entry(worker.to_string())
            .or_default();

        buffer.push_back(entry);
        while buffer.len() > cap {
            buffer.pop_front();
        }
    }
}

/// Accumulates signal batches and decides when they flush.
pub struct SignalsBatcher {
    settings: HealthSettings,
    application_id: String,
    runtime_id: String,
    batch: Option<OpenBatch>,
}

impl SignalsBatcher {
    pub fn new(
        settings: HealthSettings,
        application_id: impl Into<String>,
        runtime_id: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            application_id: application_id.into(),
            runtime_id: runtime_id.into(),
            batch: None,
        }
    }

    /// Record one sample into the open batch, opening one if needed.
    pub fn record(&mut self, sample: &HealthSample) {
        let cap = self.settings.signal_buffer_cap;
        let batch = self
            .batch
            .get_or_insert_with(|| OpenBatch::new(sample.timestamp));

        let worker = sample.worker.to_string();
        let heap_mib = (sample.heap_used_bytes as f64 / MIB).round();
        let hot =
            sample.elu > self.settings.elu_threshold || heap_mib > self.settings.heap_threshold;

        let service = batch
            .services
            .entry(sample.worker.service_id.clone())
            .or_default();
        service.push(
            &SignalType::Elu,
            &worker,
            (sample.timestamp, sample.elu),
            cap,
        );
        service.push(&SignalType::Heap, &worker, (sample.timestamp, heap_mib), cap);
        service.heap_total_mib = Some((sample.heap_total_bytes as f64 / MIB).round());
        for signal in &sample.health_signals {
            service.push(
                &SignalType::Custom(signal.name.clone()),
                &worker,
                (sample.timestamp, signal.value),
                cap,
            );
        }

        if hot {
            batch.hot = true;
        }
    }

    /// Close and return the batch once it has aged past its timeout.
    pub fn tick(&mut self, now_ms: i64) -> Option<SignalsPayload> {
        let batch = self.batch.as_mut()?;

        if batch.is_empty() {
            // nothing recorded since the last flush; keep sliding forward
            batch.started_at = now_ms;
            return None;
        }

        let timeout = if batch.hot {
            self.settings.batch_short_millis
        } else {
            self.settings.batch_long_millis
        };
        if now_ms - batch.started_at < timeout as i64 {
            return None;
        }

        let closed = std::mem::replace(batch, OpenBatch::new(now_ms));
        Some(self.to_payload(closed))
    }

    fn to_payload(&self, batch: OpenBatch) -> SignalsPayload {
        let mut signals = BTreeMap::new();

        for (service, service_signals) in batch.services {
            let heap_total = service_signals.heap_total_mib;
            let mut per_service = BTreeMap::new();

            for (kind, workers) in service_signals.series {
                let options = match kind.as_str() {
                    "elu" => SignalOptions {
                        threshold: Some(self.settings.elu_threshold),
                        heap_total: None,
                    },
                    "heap" => SignalOptions {
                        threshold: Some(self.settings.heap_threshold),
                        heap_total,
                    },
                    _ => SignalOptions::default(),
                };

                let workers = workers
                    .into_iter()
                    .map(|(worker, values)| {
                        (
                            worker,
                            WorkerSeries {
                                values: values.into_iter().collect(),
                            },
                        )
                    })
                    .collect();

                per_service.insert(kind, SignalSeries { options, workers });
            }

            signals.insert(service, per_service);
        }

        SignalsPayload {
            application_id: self.application_id.clone(),
            runtime_id: self.runtime_id.clone(),
            batch_started_at: batch.started_at,
            signals,
        }
    }
}

/// Drives a [`SignalsBatcher`] from the health event stream and posts closed
/// batches to the control center.
pub struct SignalsWorker {
    batcher: SignalsBatcher,
    icc: Arc<dyn ControlCenter>,
    triggers: mpsc::Sender<ProfileTrigger>,
    metrics: AgentMetrics,
}

impl SignalsWorker {
    pub fn new(
        batcher: SignalsBatcher,
        icc: Arc<dyn ControlCenter>,
        triggers: mpsc::Sender<ProfileTrigger>,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            batcher,
            icc,
            triggers,
            metrics,
        }
    }

    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<HealthSample>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            short_millis = self.batcher.settings.batch_short_millis,
            long_millis = self.batcher.settings.batch_long_millis,
            "Starting health-signals worker"
        );

        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(sample) => self.batcher.record(&sample),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Signals worker lagged behind health events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    self.flush_if_due(now_ms).await;
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("Health-signals worker stopped");
    }

    async fn flush_if_due(&mut self, now_ms: i64) {
        let Some(payload) = self.batcher.tick(now_ms) else {
            return;
        };

        let started = Instant::now();
        match self.icc.post_signals(&payload).await {
            Ok(alerts) => {
                self.metrics.inc_signal_batches();
                self.metrics
                    .observe_signals_post_latency(started.elapsed().as_secs_f64());
                debug!(
                    services = payload.signals.len(),
                    alerts = alerts.len(),
                    "Flushed signal batch"
                );

                for alert in alerts {
                    let trigger = ProfileTrigger::Service {
                        service_id: alert.service_id,
                        profile_type: ProfileType::Cpu,
                        alert_id: Some(alert.alert_id),
                    };
                    if self.triggers.send(trigger).await.is_err() {
                        debug!("Profile trigger channel closed, dropping alert");
                    }
                }
            }
            Err(e) => {
                // the data is gone with the batch; the next flush retries the
                // endpoint with fresh samples
                warn!(error = %e, "Failed to post signal batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertRef, CustomSignal, WorkerId};
    use crate::testing::{sample, MockControlCenter};

    fn batcher() -> SignalsBatcher {
        let settings = HealthSettings {
            elu_threshold: 0.8,
            heap_threshold: 512.0,
            batch_short_millis: 1_000,
            batch_long_millis: 10_000,
            ..HealthSettings::default()
        };
        SignalsBatcher::new(settings, "shop", "rt-1")
    }

    #[test]
    fn test_short_flush_when_elu_exceeds_threshold() {
        let mut batcher = batcher();

        batcher.record(&sample("main", 0, 0.1, 0));
        batcher.record(&sample("main", 0, 0.9, 200));

        assert!(batcher.tick(999).is_none());
        let payload = batcher.tick(1_000).expect("short timeout elapsed");

        assert_eq!(payload.batch_started_at, 0);
        assert_eq!(payload.signals.len(), 1);
        let elu = &payload.signals["main"]["elu"];
        assert_eq!(elu.options.threshold, Some(0.8));
        assert_eq!(
            elu.workers["main:0"].values,
            vec![(0, 0.1), (200, 0.9)]
        );
    }

    #[test]
    fn test_quiet_batch_waits_for_long_timeout() {
        let mut batcher = batcher();

        batcher.record(&sample("main", 0, 0.1, 0));

        assert!(batcher.tick(1_000).is_none());
        assert!(batcher.tick(9_999).is_none());
        assert!(batcher.tick(10_000).is_some());
    }

    #[test]
    fn test_new_batch_opens_at_flush_time() {
        let mut batcher = batcher();

        batcher.record(&sample("main", 0, 0.9, 0));
        batcher.tick(1_000).expect("first flush");

        batcher.record(&sample("main", 0, 0.9, 1_200));
        let payload = batcher.tick(2_000).expect("second flush");

        assert_eq!(payload.batch_started_at, 1_000);
        assert_eq!(payload.signals["main"]["elu"].workers["main:0"].values.len(), 1);
    }

    #[test]
    fn test_empty_batch_never_flushes() {
        let mut batcher = batcher();

        batcher.record(&sample("main", 0, 0.9, 0));
        batcher.tick(1_000).expect("flush");

        // no samples since the flush; the empty batch slides forward
        assert!(batcher.tick(60_000).is_none());
        assert!(batcher.tick(120_000).is_none());
    }

    #[test]
    fn test_buffer_capped_at_configured_size() {
        let mut batcher = batcher();

        for i in 0..600 {
            batcher.record(&sample("main", 0, 0.1, i));
        }

        let payload = batcher.tick(20_000).expect("long timeout");
        let values = &payload.signals["main"]["elu"].workers["main:0"].values;
        assert_eq!(values.len(), 500);
        assert_eq!(values[0].0, 100); // oldest 100 dropped
    }

    #[test]
    fn test_heap_series_in_rounded_mib_with_total() {
        let mut batcher = batcher();

        let mut s = sample("main", 0, 0.1, 0);
        s.heap_used_bytes = (100.4 * MIB) as u64;
        s.heap_total_bytes = (512.0 * MIB) as u64;
        batcher.record(&s);

        let payload = batcher.tick(20_000).expect("long timeout");
        let heap = &payload.signals["main"]["heap"];
        assert_eq!(heap.workers["main:0"].values, vec![(0, 100.0)]);
        assert_eq!(heap.options.threshold, Some(512.0));
        assert_eq!(heap.options.heap_total, Some(512.0));
    }

    #[test]
    fn test_heap_above_threshold_makes_batch_hot() {
        let mut batcher = batcher();

        let mut s = sample("main", 0, 0.1, 0);
        s.heap_used_bytes = (600.0 * MIB) as u64;
        batcher.record(&s);

        assert!(batcher.tick(1_000).is_some());
    }

    #[test]
    fn test_custom_signals_forwarded_verbatim() {
        let mut batcher = batcher();

        let mut s = sample("main", 0, 0.1, 100);
        s.health_signals = vec![CustomSignal {
            name: "rss".to_string(),
            value: 42.0,
        }];
        batcher.record(&s);

        let payload = batcher.tick(20_000).expect("long timeout");
        let rss = &payload.signals["main"]["rss"];
        assert_eq!(rss.options, SignalOptions::default());
        assert_eq!(rss.workers["main:0"].values, vec![(100, 42.0)]);
    }

    #[tokio::test]
    async fn test_flush_dispatches_returned_alerts_as_cpu_triggers() {
        let icc = Arc::new(MockControlCenter::new());
        icc.signal_alerts.lock().unwrap().push(AlertRef {
            service_id: "main".to_string(),
            worker_id: WorkerId::new("main", 0).to_string(),
            alert_id: "a1".to_string(),
        });

        let (trigger_tx, mut trigger_rx) = mpsc::channel(4);
        let mut worker = SignalsWorker::new(batcher(), icc.clone(), trigger_tx, AgentMetrics::new());

        worker.batcher.record(&sample("main", 0, 0.9, 0));
        worker.flush_if_due(1_000).await;

        assert_eq!(icc.signals.lock().unwrap().len(), 1);
        match trigger_rx.recv().await.unwrap() {
            ProfileTrigger::Service {
                service_id,
                profile_type,
                alert_id,
            } => {
                assert_eq!(service_id, "main");
                assert_eq!(profile_type, ProfileType::Cpu);
                assert_eq!(alert_id.as_deref(), Some("a1"));
            }
            other => panic!("unexpected trigger: {other:?}"),
        }
    }
}
