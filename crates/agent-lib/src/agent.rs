//! Agent assembly and lifecycle
//!
//! The [`Agent`] value owns every control loop: it wires the health event
//! stream into scaling, signals and alerts, hands profile triggers to the
//! profiling controller, and tears everything down in a fixed order. Without
//! a control center url the agent is standalone: no network I/O is initiated
//! and only the local scaling loop runs.

use crate::alerts::AlertEngine;
use crate::health::{components, HealthRegistry};
use crate::icc::{
    AuthProvider, BearerTokenProvider, ControlCenter, ControlChannel, ControlEvent, IccClient,
};
use crate::models::ProfileRequest;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::profiling::{
    run_states_reporter, ProfileTrigger, ProfileUploader, ProfilingController,
};
use crate::runtime::WorkerRuntime;
use crate::scaling::ScalingController;
use crate::settings::{AgentSettings, ScalerVersion};
use crate::signals::{SignalsBatcher, SignalsWorker};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TRIGGER_BUFFER: usize = 64;
const PRODUCED_BUFFER: usize = 16;
const CONTROL_BUFFER: usize = 16;

pub struct Agent {
    runtime: Arc<dyn WorkerRuntime>,
    shutdown_tx: broadcast::Sender<()>,
    closing: Arc<AtomicBool>,
    profiling: Option<Arc<ProfilingController>>,
    control_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    logger: StructuredLogger,
}

impl Agent {
    /// Wire and start every loop the configuration calls for.
    pub async fn start(
        settings: AgentSettings,
        runtime: Arc<dyn WorkerRuntime>,
        registry: HealthRegistry,
    ) -> Result<Self> {
        let metrics = AgentMetrics::new();
        let logger = StructuredLogger::new(&settings.pod_id);
        let (shutdown_tx, _) = broadcast::channel(4);
        let closing = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::new();

        // local scaling runs in every mode, standalone included
        let scaling = Arc::new(ScalingController::new(
            runtime.clone(),
            &settings.scaler,
            metrics.clone(),
        ));
        registry.register(components::SCALING).await;
        tasks.push(tokio::spawn(
            scaling.run(runtime.health_events(), shutdown_tx.subscribe()),
        ));

        let mut profiling = None;
        let mut control_task = None;

        if let Some(url) = settings.icc.url.clone() {
            let auth: Arc<dyn AuthProvider> =
                Arc::new(BearerTokenProvider::new(settings.icc.token.clone()));
            let client = Arc::new(
                IccClient::new(&url, &settings.pod_id, &settings.application_id, auth.clone())
                    .context("invalid control center url")?,
            );
            let icc: Arc<dyn ControlCenter> = client.clone();

            // fan-in for profile triggers raised by signals and the control
            // channel
            let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUFFER);

            if settings.flamegraphs.disabled {
                info!("Flamegraphs disabled by configuration");
            } else {
                let (produced_tx, produced_rx) = mpsc::channel(PRODUCED_BUFFER);
                let controller = Arc::new(ProfilingController::new(
                    runtime.clone(),
                    settings.flamegraphs.clone(),
                    produced_tx,
                    metrics.clone(),
                ));
                registry.register(components::PROFILING).await;
                tasks.push(tokio::spawn(
                    ProfileUploader::new(icc.clone(), metrics.clone()).run(produced_rx),
                ));
                tasks.push(tokio::spawn(run_states_reporter(
                    controller.clone(),
                    icc.clone(),
                    shutdown_tx.subscribe(),
                )));
                profiling = Some(controller);
            }
            tasks.push(tokio::spawn(run_trigger_dispatch(
                profiling.clone(),
                trigger_rx,
            )));

            match settings.scaler.version {
                ScalerVersion::V2 if runtime.supports_health_metrics() => {
                    let batcher = SignalsBatcher::new(
                        settings.health.clone(),
                        &settings.application_id,
                        &settings.runtime_id,
                    );
                    let worker = SignalsWorker::new(
                        batcher,
                        icc.clone(),
                        trigger_tx.clone(),
                        metrics.clone(),
                    );
                    registry.register(components::SIGNALS).await;
                    tasks.push(tokio::spawn(
                        worker.run(runtime.health_events(), shutdown_tx.subscribe()),
                    ));
                }
                ScalerVersion::V2 => {
                    warn!("Runtime lacks the health-metrics event; health signals disabled");
                }
                ScalerVersion::V1 => {
                    let engine = AlertEngine::new(
                        &settings.application_id,
                        settings.alerts.clone(),
                        &settings.health,
                        &settings.flamegraphs,
                        icc.clone(),
                        profiling.clone(),
                        metrics.clone(),
                    );
                    registry.register(components::ALERTS).await;
                    tasks.push(tokio::spawn(
                        engine.run(runtime.health_events(), shutdown_tx.subscribe()),
                    ));
                }
            }

            let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
            let channel = ControlChannel::new(
                client.base_url(),
                &settings.application_id,
                auth,
                settings.icc.reconnect_interval(),
                control_tx,
                closing.clone(),
                metrics.clone(),
            )?;
            registry.register(components::CONTROL_CHANNEL).await;
            control_task = Some(tokio::spawn(channel.run()));
            tasks.push(tokio::spawn(run_control_dispatch(
                control_rx,
                runtime.clone(),
                trigger_tx,
            )));
        } else {
            logger.log_standalone();
        }

        registry.register(components::RUNTIME).await;
        registry.set_ready(true).await;
        info!(
            standalone = settings.standalone(),
            application_id = %settings.application_id,
            "Agent started"
        );

        Ok(Self {
            runtime,
            shutdown_tx,
            closing,
            profiling,
            control_task,
            tasks,
            logger,
        })
    }

    /// Tear down in order: the control channel first so no reconnect races
    /// the shutdown, then every profiler, then the runtime adapter.
    pub async fn shutdown(mut self, reason: &str) {
        self.logger.log_shutdown(reason);

        self.closing.store(true, Ordering::SeqCst);
        if let Some(control) = self.control_task.take() {
            control.abort();
            let _ = control.await;
        }

        let _ = self.shutdown_tx.send(());

        if let Some(profiling) = &self.profiling {
            profiling.shutdown().await;
        }

        if let Err(e) = self.runtime.close().await {
            warn!(error = %e, "Runtime adapter close failed");
        }

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn run_trigger_dispatch(
    profiling: Option<Arc<ProfilingController>>,
    mut triggers: mpsc::Receiver<ProfileTrigger>,
) {
    while let Some(trigger) = triggers.recv().await {
        let Some(controller) = &profiling else {
            debug!("Profiling disabled, ignoring trigger");
            continue;
        };
        match trigger {
            ProfileTrigger::Service {
                service_id,
                profile_type,
                alert_id,
            } => {
                controller
                    .request_profile(&service_id, profile_type, ProfileRequest::now(alert_id))
                    .await;
            }
            ProfileTrigger::AllServices { profile_type } => {
                controller.request_all(profile_type).await;
            }
        }
    }
}

async fn run_control_dispatch(
    mut events: mpsc::Receiver<ControlEvent>,
    runtime: Arc<dyn WorkerRuntime>,
    triggers: mpsc::Sender<ProfileTrigger>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ControlEvent::TriggerProfile(profile_type) => {
                info!(
                    profile_type = %profile_type,
                    "Control center requested profiles for all services"
                );
                if triggers
                    .send(ProfileTrigger::AllServices { profile_type })
                    .await
                    .is_err()
                {
                    debug!("Profile trigger channel closed");
                }
            }
            ControlEvent::ConfigUpdated { topic, data } => {
                info!(topic = %topic, "Applying configuration update from control center");
                if let Err(e) = runtime.apply_config_update(&topic, data).await {
                    warn!(error = %e, topic = %topic, "Failed to apply configuration update");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfileType;
    use crate::testing::{sample, MockRuntime, RuntimeCall};
    use std::time::Duration;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 2s");
    }

    #[tokio::test]
    async fn test_standalone_agent_scales_locally() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![
            crate::models::WorkerId::new("hot", 0),
            crate::models::WorkerId::new("hot", 1),
            crate::models::WorkerId::new("cold", 0),
        ]));
        let registry = HealthRegistry::new();
        let agent = Agent::start(AgentSettings::default(), runtime.clone(), registry.clone())
            .await
            .unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        runtime.emit(sample("cold", 0, 0.4, now - 10));
        runtime.emit(sample("hot", 0, 0.95, now));

        wait_for(|| {
            runtime
                .calls()
                .iter()
                .any(|call| matches!(call, RuntimeCall::UpdateResources(_)))
        })
        .await;

        assert!(registry.readiness().await.ready);

        agent.shutdown("test over").await;
        assert!(runtime
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::Close)));
    }

    #[tokio::test]
    async fn test_connected_agent_starts_and_stops_cleanly() {
        let runtime = Arc::new(MockRuntime::with_workers(vec![
            crate::models::WorkerId::new("main", 0),
        ]));
        let registry = HealthRegistry::new();
        let settings: AgentSettings = serde_json::from_str(
            r#"{
                "application_id": "shop",
                "icc": { "url": "http://127.0.0.1:9", "reconnect_interval_millis": 50 }
            }"#,
        )
        .unwrap();

        let agent = Agent::start(settings, runtime.clone(), registry.clone())
            .await
            .unwrap();

        let health = registry.health().await;
        assert!(health.components.contains_key(components::PROFILING));
        assert!(health.components.contains_key(components::ALERTS));
        assert!(health.components.contains_key(components::CONTROL_CHANNEL));

        tokio::time::timeout(Duration::from_secs(5), agent.shutdown("test over"))
            .await
            .expect("shutdown hung");

        assert!(runtime
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::Close)));
    }

    #[tokio::test]
    async fn test_trigger_dispatch_without_profiling_drains() {
        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_trigger_dispatch(None, trigger_rx));

        trigger_tx
            .send(ProfileTrigger::AllServices {
                profile_type: ProfileType::Cpu,
            })
            .await
            .unwrap();
        drop(trigger_tx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatch did not drain")
            .unwrap();
    }

    #[tokio::test]
    async fn test_control_dispatch_applies_config_updates() {
        let runtime = Arc::new(MockRuntime::new());
        let (control_tx, control_rx) = mpsc::channel(4);
        let (trigger_tx, mut trigger_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_control_dispatch(
            control_rx,
            runtime.clone() as Arc<dyn WorkerRuntime>,
            trigger_tx,
        ));

        control_tx
            .send(ControlEvent::ConfigUpdated {
                topic: "/config".to_string(),
                data: serde_json::json!({"maxWorkers": 4}),
            })
            .await
            .unwrap();
        control_tx
            .send(ControlEvent::TriggerProfile(ProfileType::Heap))
            .await
            .unwrap();
        drop(control_tx);

        assert_eq!(
            trigger_rx.recv().await.unwrap(),
            ProfileTrigger::AllServices {
                profile_type: ProfileType::Heap
            }
        );
        task.await.unwrap();

        assert!(runtime
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::ApplyConfig(topic) if topic == "/config")));
    }
}
