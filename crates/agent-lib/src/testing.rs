//! Shared test doubles for the runtime boundary and the control center.

use crate::error::{CommandError, IccError};
use crate::icc::{AlertPayload, ControlCenter, SignalsPayload};
use crate::models::{AlertRef, HealthSample, ProfileType, ProfilerState, ResourceUpdate, WorkerId};
use crate::runtime::{ProfileChunk, ProfilingOptions, WorkerProfilingState, WorkerRuntime};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Commands observed by the mock runtime, in call order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RuntimeCall {
    StartProfiling(WorkerId, ProfileType),
    StopProfiling(WorkerId, ProfileType),
    LastProfile(WorkerId, ProfileType),
    UpdateResources(Vec<ResourceUpdate>),
    ApplyConfig(String),
    Close,
}

/// Scriptable in-memory runtime.
pub(crate) struct MockRuntime {
    pub events: broadcast::Sender<HealthSample>,
    pub workers: Mutex<BTreeMap<String, Vec<WorkerId>>>,
    /// Results handed out by `last_profile`, front first; empty means
    /// `NoProfileAvailable`.
    pub profile_results: Mutex<VecDeque<Result<ProfileChunk, CommandError>>>,
    pub stop_error: Mutex<Option<CommandError>>,
    pub fail_updates: AtomicBool,
    pub supports_metrics: bool,
    pub calls: Mutex<Vec<RuntimeCall>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_workers(Vec::new())
    }

    pub fn with_workers(workers: Vec<WorkerId>) -> Self {
        let (events, _) = broadcast::channel(256);
        let runtime = Self {
            events,
            workers: Mutex::new(BTreeMap::new()),
            profile_results: Mutex::new(VecDeque::new()),
            stop_error: Mutex::new(None),
            fail_updates: AtomicBool::new(false),
            supports_metrics: true,
            calls: Mutex::new(Vec::new()),
        };
        runtime.set_workers(workers);
        runtime
    }

    pub fn set_workers(&self, workers: Vec<WorkerId>) {
        let mut map = BTreeMap::new();
        for worker in workers {
            map.entry(worker.service_id.clone())
                .or_insert_with(Vec::new)
                .push(worker);
        }
        *self.workers.lock().unwrap() = map;
    }

    pub fn push_profile(&self, result: Result<ProfileChunk, CommandError>) {
        self.profile_results.lock().unwrap().push_back(result);
    }

    pub fn emit(&self, sample: HealthSample) {
        let _ = self.events.send(sample);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl WorkerRuntime for MockRuntime {
    fn health_events(&self) -> broadcast::Receiver<HealthSample> {
        self.events.subscribe()
    }

    fn supports_health_metrics(&self) -> bool {
        self.supports_metrics
    }

    async fn start_profiling(
        &self,
        worker: &WorkerId,
        options: &ProfilingOptions,
    ) -> Result<(), CommandError> {
        self.record(RuntimeCall::StartProfiling(
            worker.clone(),
            options.profile_type,
        ));
        Ok(())
    }

    async fn stop_profiling(
        &self,
        worker: &WorkerId,
        profile_type: ProfileType,
    ) -> Result<(), CommandError> {
        self.record(RuntimeCall::StopProfiling(worker.clone(), profile_type));
        match self.stop_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn last_profile(
        &self,
        worker: &WorkerId,
        profile_type: ProfileType,
    ) -> Result<ProfileChunk, CommandError> {
        self.record(RuntimeCall::LastProfile(worker.clone(), profile_type));
        self.profile_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CommandError::NoProfileAvailable))
    }

    async fn profiling_state(
        &self,
        _worker: &WorkerId,
        _profile_type: ProfileType,
    ) -> Result<WorkerProfilingState, CommandError> {
        Ok(WorkerProfilingState::Inactive)
    }

    async fn list_workers(&self) -> Result<BTreeMap<String, Vec<WorkerId>>, CommandError> {
        Ok(self.workers.lock().unwrap().clone())
    }

    async fn update_applications_resources(
        &self,
        updates: &[ResourceUpdate],
    ) -> Result<(), CommandError> {
        self.record(RuntimeCall::UpdateResources(updates.to_vec()));
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(CommandError::Failed("update rejected".to_string()));
        }
        Ok(())
    }

    async fn apply_config_update(
        &self,
        topic: &str,
        _data: serde_json::Value,
    ) -> Result<(), CommandError> {
        self.record(RuntimeCall::ApplyConfig(topic.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), CommandError> {
        self.record(RuntimeCall::Close);
        Ok(())
    }
}

/// One recorded flamegraph upload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UploadCall {
    pub service_id: String,
    pub profile_type: ProfileType,
    pub alert_id: Option<String>,
    pub bytes: Vec<u8>,
}

/// Recording control center double.
#[derive(Default)]
pub(crate) struct MockControlCenter {
    pub signals: Mutex<Vec<SignalsPayload>>,
    /// Alerts returned by the next `post_signals` call.
    pub signal_alerts: Mutex<Vec<AlertRef>>,
    pub alerts: Mutex<Vec<AlertPayload>>,
    pub uploads: Mutex<Vec<UploadCall>>,
    pub attaches: Mutex<Vec<(String, Vec<String>)>>,
    pub states: Mutex<Vec<Vec<ProfilerState>>>,
    pub attach_unsupported: AtomicBool,
    pub attach_fail: AtomicBool,
    upload_counter: AtomicUsize,
    alert_counter: AtomicUsize,
}

impl MockControlCenter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControlCenter for MockControlCenter {
    async fn post_signals(&self, payload: &SignalsPayload) -> Result<Vec<AlertRef>, IccError> {
        self.signals.lock().unwrap().push(payload.clone());
        Ok(self.signal_alerts.lock().unwrap().drain(..).collect())
    }

    async fn post_alert(&self, payload: &AlertPayload) -> Result<String, IccError> {
        self.alerts.lock().unwrap().push(payload.clone());
        let n = self.alert_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("alert-{n}"))
    }

    async fn upload_flamegraph(
        &self,
        service_id: &str,
        profile_type: ProfileType,
        alert_id: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String, IccError> {
        self.uploads.lock().unwrap().push(UploadCall {
            service_id: service_id.to_string(),
            profile_type,
            alert_id: alert_id.map(str::to_string),
            bytes,
        });
        let n = self.upload_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("fg-{n}"))
    }

    async fn attach_alerts(
        &self,
        flamegraph_id: &str,
        alert_ids: &[String],
    ) -> Result<(), IccError> {
        self.attaches
            .lock()
            .unwrap()
            .push((flamegraph_id.to_string(), alert_ids.to_vec()));
        if self.attach_unsupported.load(Ordering::SeqCst) {
            return Err(IccError::MultipleAlertsUnsupported);
        }
        if self.attach_fail.load(Ordering::SeqCst) {
            return Err(IccError::UnexpectedStatus {
                status: 500,
                body: "attach failed".to_string(),
            });
        }
        Ok(())
    }

    async fn post_profiler_states(
        &self,
        states: &[ProfilerState],
        _expires_in_millis: u64,
    ) -> Result<(), IccError> {
        self.states.lock().unwrap().push(states.to_vec());
        Ok(())
    }
}

/// A healthy-looking sample for one worker.
pub(crate) fn sample(service: &str, index: u32, elu: f64, timestamp: i64) -> HealthSample {
    HealthSample {
        worker: WorkerId::new(service, index),
        elu,
        heap_used_bytes: 100 * 1024 * 1024,
        heap_total_bytes: 512 * 1024 * 1024,
        timestamp,
        unhealthy: None,
        health_signals: Vec::new(),
    }
}
