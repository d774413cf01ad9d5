//! Upload sink for produced profiles
//!
//! Consumes produced profiles from a channel and binds them to their alerts:
//! one upload carrying the first alert, the rest attached to the returned
//! flamegraph. Control centers without the attach endpoint get one upload per
//! alert instead.

use crate::error::IccError;
use crate::icc::ControlCenter;
use crate::observability::AgentMetrics;
use crate::profiling::profiler::ProducedProfile;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct ProfileUploader {
    icc: Arc<dyn ControlCenter>,
    metrics: AgentMetrics,
}

impl ProfileUploader {
    pub fn new(icc: Arc<dyn ControlCenter>, metrics: AgentMetrics) -> Self {
        Self { icc, metrics }
    }

    /// Drain produced profiles until every sender is gone.
    pub async fn run(self, mut produced_rx: mpsc::Receiver<ProducedProfile>) {
        while let Some(produced) = produced_rx.recv().await {
            self.handle(produced).await;
        }
        debug!("Profile sink channel closed");
    }

    async fn handle(&self, produced: ProducedProfile) {
        let alert_ids: Vec<String> = produced
            .requests
            .iter()
            .filter_map(|request| request.alert_id.clone())
            .collect();
        let (first, rest): (Option<&str>, &[String]) = match alert_ids.split_first() {
            Some((first, rest)) => (Some(first.as_str()), rest),
            None => (None, &[]),
        };

        let started = Instant::now();
        let flamegraph_id = match self
            .icc
            .upload_flamegraph(
                &produced.service_id,
                produced.profile_type,
                first,
                produced.bytes.clone(),
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    error = %e,
                    service_id = %produced.service_id,
                    profile_type = %produced.profile_type,
                    "Failed to upload flamegraph"
                );
                return;
            }
        };
        self.metrics.inc_profiles_uploaded();
        self.metrics
            .observe_upload_latency(started.elapsed().as_secs_f64());
        info!(
            service_id = %produced.service_id,
            profile_type = %produced.profile_type,
            flamegraph_id = %flamegraph_id,
            alerts = alert_ids.len(),
            "Uploaded flamegraph"
        );

        if rest.is_empty() {
            return;
        }

        match self.icc.attach_alerts(&flamegraph_id, rest).await {
            Ok(()) => {}
            Err(IccError::MultipleAlertsUnsupported) => {
                info!(
                    flamegraph_id = %flamegraph_id,
                    "Control center cannot attach multiple alerts, re-uploading per alert"
                );
                for alert_id in rest {
                    match self
                        .icc
                        .upload_flamegraph(
                            &produced.service_id,
                            produced.profile_type,
                            Some(alert_id),
                            produced.bytes.clone(),
                        )
                        .await
                    {
                        Ok(_) => self.metrics.inc_profiles_uploaded(),
                        Err(e) => warn!(
                            error = %e,
                            alert_id = %alert_id,
                            "Failed to re-upload flamegraph for alert"
                        ),
                    }
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    flamegraph_id = %flamegraph_id,
                    "Failed to attach alerts to flamegraph"
                );
            }
        }
    }
}
