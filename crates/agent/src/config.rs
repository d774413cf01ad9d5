//! Binary configuration

use agent_lib::AgentSettings;
use anyhow::{Context, Result};

/// Full binary configuration: the agent settings plus the local HTTP port.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port for the health/metrics HTTP surface.
    pub api_port: u16,
    pub agent: AgentSettings,
}

/// Load configuration from `AGENT`-prefixed environment variables; nested
/// sections use `__` (e.g. `AGENT_ICC__URL`). Anything missing falls back to
/// defaults.
pub fn load() -> Result<AppConfig> {
    let source = config::Config::builder()
        .add_source(config::Environment::with_prefix("AGENT").separator("__"))
        .build()
        .context("failed to read environment configuration")?;

    let api_port = source
        .get_int("api_port")
        .map(|port| port as u16)
        .unwrap_or(8080);
    let agent: AgentSettings = source.try_deserialize().unwrap_or_default();

    Ok(AppConfig { api_port, agent })
}
