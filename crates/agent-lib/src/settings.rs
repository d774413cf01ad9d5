//! Agent configuration
//!
//! Typed record covering every key recognized by the agent. Unknown keys in
//! the source configuration are ignored; every field has a default so a bare
//! environment still yields a runnable (standalone) agent.

use serde::Deserialize;
use std::time::Duration;

/// Remote scaler algorithm generation. `v1` drives the local alert engine,
/// `v2` the health-signals batcher; the two are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ScalerVersion {
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2")]
    V2,
}

/// Top-level agent settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Pod identity used in flamegraph upload paths and state reports.
    pub pod_id: String,
    /// Application identity used in ICC payloads and the control channel path.
    pub application_id: String,
    /// Runtime identity reported with signal batches.
    pub runtime_id: String,
    pub icc: IccSettings,
    pub scaler: ScalerSettings,
    pub flamegraphs: FlamegraphSettings,
    pub health: HealthSettings,
    pub alerts: AlertSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            pod_id: default_identity("POD_ID"),
            application_id: default_identity("APPLICATION_ID"),
            runtime_id: default_identity("RUNTIME_ID"),
            icc: IccSettings::default(),
            scaler: ScalerSettings::default(),
            flamegraphs: FlamegraphSettings::default(),
            health: HealthSettings::default(),
            alerts: AlertSettings::default(),
        }
    }
}

impl AgentSettings {
    /// Without a control center url the agent initiates no network I/O;
    /// local decision loops still run.
    pub fn standalone(&self) -> bool {
        self.icc.url.is_none()
    }
}

fn default_identity(var: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| "unknown".to_string())
}

/// Control center transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IccSettings {
    /// Base url of the Infrastructure Control Center. Absent means standalone.
    pub url: Option<String>,
    pub reconnect_interval_millis: u64,
    /// Static bearer token for the default auth provider.
    pub token: Option<String>,
}

impl Default for IccSettings {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_interval_millis: 5_000,
            token: None,
        }
    }
}

impl IccSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_millis)
    }
}

/// Thresholds and cadence for the scaling loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScalerSettings {
    pub version: ScalerVersion,
    /// Cap on the total number of workers across applications.
    pub max_workers: u32,
    pub scale_up_elu: f64,
    pub scale_down_elu: f64,
    /// Minimum ELU gap required to reallocate a worker at the cap.
    pub min_elu_diff: f64,
    pub time_window_sec: u64,
    pub cooldown_sec: u64,
    pub check_interval_sec: u64,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            version: ScalerVersion::V1,
            max_workers: 10,
            scale_up_elu: 0.8,
            scale_down_elu: 0.2,
            min_elu_diff: 0.2,
            time_window_sec: 60,
            cooldown_sec: 60,
            check_interval_sec: 10,
        }
    }
}

impl ScalerSettings {
    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_sec)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }
}

/// Profiling policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlamegraphSettings {
    /// Disables profiling entirely.
    pub disabled: bool,
    pub duration_sec: u64,
    /// ELU at which the alert engine pauses profiling for a service.
    pub pause_elu_threshold: f64,
    pub pause_timeout_millis: u64,
    pub states_refresh_interval_sec: u64,
    /// Spacing between attempts when a produced profile is not yet available.
    pub fetch_attempt_timeout_millis: u64,
    pub source_maps: bool,
}

impl Default for FlamegraphSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            duration_sec: 60,
            pause_elu_threshold: 0.9,
            pause_timeout_millis: 60_000,
            states_refresh_interval_sec: 10,
            fetch_attempt_timeout_millis: 1_000,
            source_maps: false,
        }
    }
}

impl FlamegraphSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_sec)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_millis)
    }

    pub fn states_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.states_refresh_interval_sec)
    }

    pub fn fetch_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_attempt_timeout_millis)
    }
}

/// Health-signals batching thresholds (v2 scaler only).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// ELU above which the open batch flushes on the short timeout.
    pub elu_threshold: f64,
    /// Heap-used threshold in MiB with the same effect.
    pub heap_threshold: f64,
    pub batch_short_millis: u64,
    pub batch_long_millis: u64,
    /// Heap-used fraction above which a sample is considered unhealthy when
    /// the runtime does not flag it itself.
    pub max_heap_used: f64,
    /// Cap on buffered entries per (service, signal, worker).
    pub signal_buffer_cap: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            elu_threshold: 0.9,
            heap_threshold: 1_024.0,
            batch_short_millis: 10_000,
            batch_long_millis: 60_000,
            max_heap_used: 0.9,
            signal_buffer_cap: 500,
        }
    }
}

/// Alert engine gating (v1 scaler only).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Suppression window after a worker is first seen.
    pub grace_period_sec: u64,
    /// Retention of the health history posted with an alert.
    pub pod_health_window_ms: u64,
    /// Minimum spacing between alerts for the same service.
    pub alert_retention_window_ms: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            grace_period_sec: 30,
            pod_health_window_ms: 30_000,
            alert_retention_window_ms: 60_000,
        }
    }
}

impl AlertSettings {
    pub fn grace_period_ms(&self) -> i64 {
        (self.grace_period_sec * 1_000) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_standalone() {
        let settings = AgentSettings::default();
        assert!(settings.standalone());
        assert_eq!(settings.scaler.version, ScalerVersion::V1);
        assert_eq!(settings.scaler.max_workers, 10);
        assert_eq!(settings.health.signal_buffer_cap, 500);
        assert_eq!(settings.flamegraphs.states_refresh_interval_sec, 10);
    }

    #[test]
    fn test_deserialize_partial_document() {
        let settings: AgentSettings = serde_json::from_str(
            r#"{
                "application_id": "shop",
                "icc": { "url": "https://icc.example.com" },
                "scaler": { "version": "v2", "max_workers": 4 },
                "health": { "elu_threshold": 0.8 }
            }"#,
        )
        .unwrap();

        assert!(!settings.standalone());
        assert_eq!(settings.application_id, "shop");
        assert_eq!(settings.scaler.version, ScalerVersion::V2);
        assert_eq!(settings.scaler.max_workers, 4);
        assert_eq!(settings.health.elu_threshold, 0.8);
        // untouched sections keep their defaults
        assert_eq!(settings.scaler.scale_down_elu, 0.2);
        assert_eq!(settings.alerts.grace_period_sec, 30);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let settings: AgentSettings =
            serde_json::from_str(r#"{"compliance": {"enabled": true}, "pod_id": "pod-1"}"#)
                .unwrap();
        assert_eq!(settings.pod_id, "pod-1");
    }
}
