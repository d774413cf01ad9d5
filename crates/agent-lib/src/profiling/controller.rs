//! Profiler ownership, pause windows and worker selection
//!
//! At most one profiler exists per (service, profile type); later requests
//! merge into it. Requests inside a pause window are dropped. The target is
//! always the service's index-0 worker, re-resolved from the runtime on every
//! request so a replaced worker rotates the profiler.

use crate::icc::ControlCenter;
use crate::models::{ProfileRequest, ProfileType, ProfilerState, WorkerId};
use crate::observability::AgentMetrics;
use crate::profiling::profiler::{self, ProducedProfile, ProfilerHandle};
use crate::runtime::WorkerRuntime;
use crate::settings::FlamegraphSettings;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

pub struct ProfilingController {
    runtime: Arc<dyn WorkerRuntime>,
    settings: FlamegraphSettings,
    profilers: Mutex<HashMap<(String, ProfileType), ProfilerHandle>>,
    /// Per-service pause expiry; an entry at or past its instant is expired.
    pause: Mutex<HashMap<String, Instant>>,
    produced_tx: mpsc::Sender<ProducedProfile>,
    metrics: AgentMetrics,
}

impl ProfilingController {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        settings: FlamegraphSettings,
        produced_tx: mpsc::Sender<ProducedProfile>,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            runtime,
            settings,
            profilers: Mutex::new(HashMap::new()),
            pause: Mutex::new(HashMap::new()),
            produced_tx,
            metrics,
        }
    }

    /// Route a profile request to the service's profiler, creating or
    /// replacing it as needed.
    pub async fn request_profile(
        &self,
        service_id: &str,
        profile_type: ProfileType,
        request: ProfileRequest,
    ) {
        if self.is_paused(service_id).await {
            info!(
                service_id,
                profile_type = %profile_type,
                "Profiling paused for service, dropping profile request"
            );
            self.metrics.inc_profile_requests_dropped();
            return;
        }

        let workers = match self.runtime.list_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!(error = %e, "Failed to list workers for profile request");
                return;
            }
        };
        let Some(target) = workers
            .get(service_id)
            .and_then(|list| list.first())
            .cloned()
        else {
            warn!(service_id, "No workers available to profile");
            return;
        };

        let mut profilers = self.profilers.lock().await;
        let key = (service_id.to_string(), profile_type);

        if let Some(existing) = profilers.remove(&key) {
            if existing.worker == target {
                if existing.request(request.clone()).await {
                    profilers.insert(key, existing);
                    return;
                }
                // the profiler idled out on its own; replace it below
            } else {
                // the target worker is gone; retire the old profiler
                info!(
                    service_id,
                    old_worker = %existing.worker,
                    new_worker = %target,
                    "Profiled worker is gone, rotating profiler"
                );
                existing.stop().await;
            }
        }

        let handle = self.spawn_profiler(service_id, profile_type, target);
        handle.request(request).await;
        profilers.insert(key, handle);
        self.metrics.set_active_profilers(profilers.len() as i64);
    }

    /// Request one profile of the given type for every service.
    pub async fn request_all(&self, profile_type: ProfileType) {
        let services: Vec<String> = match self.runtime.list_workers().await {
            Ok(workers) => workers.keys().cloned().collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list workers for bulk profile request");
                return;
            }
        };

        for service_id in services {
            self.request_profile(&service_id, profile_type, ProfileRequest::now(None))
                .await;
        }
    }

    /// Pause profiling for a service and stop its active profilers. Requests
    /// arriving before the expiry are dropped.
    pub async fn pause_profiling(&self, service_id: &str, timeout: Duration) {
        self.pause
            .lock()
            .await
            .insert(service_id.to_string(), Instant::now() + timeout);
        info!(
            service_id,
            timeout_millis = timeout.as_millis() as u64,
            "Paused profiling for service"
        );

        let mut profilers = self.profilers.lock().await;
        let keys: Vec<_> = profilers
            .keys()
            .filter(|(service, _)| service == service_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(handle) = profilers.remove(&key) {
                handle.stop().await;
            }
        }
        self.metrics.set_active_profilers(profilers.len() as i64);
    }

    async fn is_paused(&self, service_id: &str) -> bool {
        let mut pause = self.pause.lock().await;
        match pause.get(service_id) {
            Some(expires_at) if Instant::now() < *expires_at => true,
            Some(_) => {
                pause.remove(service_id);
                false
            }
            None => false,
        }
    }

    /// Snapshot of every registered profiler.
    pub async fn states(&self) -> Vec<ProfilerState> {
        let profilers = self.profilers.lock().await;
        profilers
            .iter()
            .map(|((service_id, profile_type), handle)| ProfilerState {
                service_id: service_id.clone(),
                profile_type: *profile_type,
                worker_id: handle.worker.to_string(),
                phase: handle.phase(),
            })
            .collect()
    }

    /// Stop every profiler and wait for their best-effort stop commands.
    pub async fn shutdown(&self) {
        let mut profilers = self.profilers.lock().await;
        for (_, handle) in profilers.drain() {
            handle.stop().await;
            handle.join().await;
        }
        self.metrics.set_active_profilers(0);
    }

    fn spawn_profiler(
        &self,
        service_id: &str,
        profile_type: ProfileType,
        worker: WorkerId,
    ) -> ProfilerHandle {
        profiler::spawn(
            service_id.to_string(),
            profile_type,
            worker,
            self.settings.duration(),
            self.settings.fetch_attempt_timeout(),
            self.settings.source_maps,
            self.runtime.clone(),
            self.produced_tx.clone(),
        )
    }
}

/// Periodically report profiler states to the control center.
pub async fn run_states_reporter(
    controller: Arc<ProfilingController>,
    icc: Arc<dyn ControlCenter>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let refresh = controller.settings.states_refresh_interval();
    // one missed beat must not expire the report on the remote side
    let expires_in_millis = (refresh.as_millis() as u64) * 2;

    let mut ticker = interval(refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let states = controller.states().await;
                if states.is_empty() {
                    continue;
                }
                if let Err(e) = icc.post_profiler_states(&states, expires_in_millis).await {
                    warn!(error = %e, "Failed to report profiler states");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfilerPhase;
    use crate::testing::{MockRuntime, RuntimeCall};

    fn settings() -> FlamegraphSettings {
        FlamegraphSettings {
            duration_sec: 1,
            fetch_attempt_timeout_millis: 100,
            ..FlamegraphSettings::default()
        }
    }

    fn controller(runtime: Arc<MockRuntime>) -> (ProfilingController, mpsc::Receiver<ProducedProfile>) {
        let (produced_tx, produced_rx) = mpsc::channel(8);
        (
            ProfilingController::new(runtime, settings(), produced_tx, AgentMetrics::new()),
            produced_rx,
        )
    }

    fn start_calls(runtime: &MockRuntime) -> Vec<RuntimeCall> {
        runtime
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RuntimeCall::StartProfiling(_, _)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_profiler_per_service_and_type() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![
            WorkerId::new("main", 0),
            WorkerId::new("main", 1),
        ]));
        let (controller, _produced_rx) = controller(runtime.clone());

        controller
            .request_profile("main", ProfileType::Cpu, ProfileRequest::now(Some("a1".to_string())))
            .await;
        controller
            .request_profile("main", ProfileType::Cpu, ProfileRequest::now(Some("a2".to_string())))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(controller.states().await.len(), 1);
        assert_eq!(start_calls(&runtime).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_and_heap_profilers_are_distinct() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![WorkerId::new("main", 0)]));
        let (controller, _produced_rx) = controller(runtime.clone());

        controller
            .request_profile("main", ProfileType::Cpu, ProfileRequest::now(None))
            .await;
        controller
            .request_profile("main", ProfileType::Heap, ProfileRequest::now(None))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let states = controller.states().await;
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.phase == ProfilerPhase::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_service_drops_requests() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![WorkerId::new("main", 0)]));
        let (controller, _produced_rx) = controller(runtime.clone());

        controller
            .pause_profiling("main", Duration::from_secs(60))
            .await;
        controller
            .request_profile("main", ProfileType::Cpu, ProfileRequest::now(None))
            .await;

        assert!(controller.states().await.is_empty());
        assert!(start_calls(&runtime).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_active_profilers() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![WorkerId::new("main", 0)]));
        let (controller, _produced_rx) = controller(runtime.clone());

        controller
            .request_profile("main", ProfileType::Cpu, ProfileRequest::now(None))
            .await;
        controller
            .pause_profiling("main", Duration::from_secs(60))
            .await;

        assert!(controller.states().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_expiry_boundary_is_expired() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![WorkerId::new("main", 0)]));
        let (controller, _produced_rx) = controller(runtime.clone());

        // expires_at == now: the window is already over
        controller.pause_profiling("main", Duration::ZERO).await;
        controller
            .request_profile("main", ProfileType::Cpu, ProfileRequest::now(None))
            .await;

        assert_eq!(controller.states().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_worker_rotates_profiler_to_new_index_zero() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![
            WorkerId::new("s", 0),
            WorkerId::new("s", 1),
        ]));
        let (controller, _produced_rx) = controller(runtime.clone());

        controller
            .request_profile("s", ProfileType::Cpu, ProfileRequest::now(None))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // worker s:0 disappears; s:1 is now index 0
        runtime.set_workers(vec![WorkerId::new("s", 1)]);
        controller
            .request_profile("s", ProfileType::Cpu, ProfileRequest::now(None))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let starts = start_calls(&runtime);
        assert_eq!(starts.len(), 2);
        assert_eq!(
            starts[0],
            RuntimeCall::StartProfiling(WorkerId::new("s", 0), ProfileType::Cpu)
        );
        assert_eq!(
            starts[1],
            RuntimeCall::StartProfiling(WorkerId::new("s", 1), ProfileType::Cpu)
        );

        let states = controller.states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].worker_id, "s:1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_all_covers_every_service() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![
            WorkerId::new("a", 0),
            WorkerId::new("b", 0),
        ]));
        let (controller, _produced_rx) = controller(runtime.clone());

        controller.request_all(ProfileType::Heap).await;

        let states = controller.states().await;
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.profile_type == ProfileType::Heap));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_every_profiler() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![
            WorkerId::new("a", 0),
            WorkerId::new("b", 0),
        ]));
        let (controller, _produced_rx) = controller(runtime.clone());

        controller.request_all(ProfileType::Cpu).await;
        controller.shutdown().await;

        assert!(controller.states().await.is_empty());
        let stops = runtime
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RuntimeCall::StopProfiling(_, _)))
            .count();
        assert_eq!(stops, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_reporter_posts_snapshots() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![WorkerId::new("main", 0)]));
        let (controller, _produced_rx) = controller(runtime.clone());
        let controller = Arc::new(controller);

        controller
            .request_profile("main", ProfileType::Cpu, ProfileRequest::now(None))
            .await;

        let icc = Arc::new(crate::testing::MockControlCenter::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let reporter = tokio::spawn(run_states_reporter(
            controller.clone(),
            icc.clone(),
            shutdown_rx,
        ));

        // let a few refresh ticks elapse
        tokio::time::sleep(Duration::from_secs(25)).await;
        let _ = shutdown_tx.send(());
        reporter.await.unwrap();

        let posted = icc.states.lock().unwrap();
        assert!(!posted.is_empty());
        assert_eq!(posted[0][0].service_id, "main");
    }
}
