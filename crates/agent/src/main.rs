//! ICC agent binary
//!
//! Runs beside a multi-worker application runtime, driving scaling, health
//! signals, profiling and the control channel against the Infrastructure
//! Control Center.

use agent_lib::{
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with env-filter overrides
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting icc-agent");

    let config = config::load()?;
    info!(
        pod_id = %config.agent.pod_id,
        application_id = %config.agent.application_id,
        standalone = config.agent.standalone(),
        "Agent configured"
    );

    let registry = HealthRegistry::new();
    registry.register(components::RUNTIME).await;
    registry.register(components::SCALING).await;

    let metrics = AgentMetrics::new();

    let logger = StructuredLogger::new(&config.agent.pod_id);
    logger.log_startup(AGENT_VERSION, &config.agent.application_id);

    let state = Arc::new(api::AppState::new(registry.clone(), metrics.clone()));
    registry.set_ready(true).await;

    let _api = tokio::spawn(api::serve(config.api_port, state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    Ok(())
}
