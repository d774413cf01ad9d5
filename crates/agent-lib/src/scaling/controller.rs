//! Scaling controller
//!
//! Feeds health samples into the rolling windows and runs the recommendation
//! algorithm behind two gates: an in-flight guard so decisions never overlap,
//! and a cooldown so an apply (successful or not) quiets the loop for a
//! while.

use crate::models::{AppInfo, HealthSample, ResourceUpdate, ScaleDirection};
use crate::observability::AgentMetrics;
use crate::runtime::WorkerRuntime;
use crate::scaling::algorithm::{recommend, ScalerOptions};
use crate::scaling::window::EluWindows;
use crate::settings::ScalerSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct ScalingState {
    last_scaling: Option<Instant>,
}

pub struct ScalingController {
    runtime: Arc<dyn WorkerRuntime>,
    options: ScalerOptions,
    cooldown: Duration,
    check_interval: Duration,
    unhealthy_elu: f64,
    windows: Mutex<EluWindows>,
    state: Mutex<ScalingState>,
    metrics: AgentMetrics,
}

impl ScalingController {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        settings: &ScalerSettings,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            runtime,
            options: ScalerOptions {
                max_workers: settings.max_workers,
                scale_up_elu: settings.scale_up_elu,
                scale_down_elu: settings.scale_down_elu,
                min_elu_diff: settings.min_elu_diff,
            },
            cooldown: settings.cooldown(),
            check_interval: settings.check_interval(),
            unhealthy_elu: settings.scale_up_elu,
            windows: Mutex::new(EluWindows::new(settings.time_window())),
            state: Mutex::new(ScalingState {
                last_scaling: None,
            }),
            metrics,
        }
    }

    /// Record one sample; an unhealthy one also attempts a scaling check.
    pub async fn on_sample(&self, sample: &HealthSample) {
        self.windows.lock().await.record(sample);

        let unhealthy = sample.unhealthy.unwrap_or(false) || sample.elu >= self.unhealthy_elu;
        if unhealthy {
            self.check_for_scaling().await;
        }
    }

    /// Run one scaling check. Skipped while a previous check is still in
    /// flight or the cooldown has not elapsed.
    pub async fn check_for_scaling(&self) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };

        if let Some(last) = state.last_scaling {
            if last.elapsed() < self.cooldown {
                return;
            }
        }

        let apps = match self.collect_apps_info().await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "Failed to read workers for scaling check");
                return;
            }
        };

        let recommendations = recommend(&apps, &self.options);
        if recommendations.is_empty() {
            debug!(apps = apps.len(), "No scaling recommended");
            return;
        }

        // the cooldown starts at the apply attempt, not its outcome, so a
        // failing runtime cannot cause tight oscillation
        state.last_scaling = Some(Instant::now());

        let updates: Vec<ResourceUpdate> = recommendations
            .iter()
            .map(|rec| ResourceUpdate {
                application_id: rec.application_id.clone(),
                workers: rec.workers,
            })
            .collect();

        match self.runtime.update_applications_resources(&updates).await {
            Ok(()) => {
                for rec in &recommendations {
                    let direction = match rec.direction {
                        ScaleDirection::Up => "up",
                        ScaleDirection::Down => "down",
                    };
                    self.metrics.inc_scaling_decisions(direction);
                    info!(
                        application_id = %rec.application_id,
                        workers = rec.workers,
                        direction = %direction,
                        "Applied scaling recommendation"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply scaling recommendations");
            }
        }
    }

    async fn collect_apps_info(&self) -> Result<Vec<AppInfo>, crate::error::CommandError> {
        let workers = self.runtime.list_workers().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut windows = self.windows.lock().await;
        let apps = workers
            .iter()
            .filter_map(|(service, list)| {
                windows.app_elu(service, now_ms).map(|elu| AppInfo {
                    application_id: service.clone(),
                    elu,
                    worker_count: list.len() as u32,
                })
            })
            .collect();
        Ok(apps)
    }

    /// Drain health events and run the periodic check until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<HealthSample>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            cooldown_secs = self.cooldown.as_secs(),
            "Starting scaling controller"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(sample) => {
                        self.metrics.inc_health_events();
                        self.on_sample(&sample).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Scaling controller lagged behind health events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.check_for_scaling().await,
                _ = shutdown.recv() => break,
            }
        }

        info!("Scaling controller stopped");
    }
}
