//! Control channel to the Infrastructure Control Center
//!
//! Persistent WebSocket carrying configuration updates and trigger commands.
//! Connects with fresh auth headers, subscribes to the `/config` topic and
//! requires an ack before dispatching frames. Errors and closes redial after
//! the reconnect interval unless the agent is shutting down.

use crate::icc::client::AuthProvider;
use crate::models::ProfileType;
use crate::observability::AgentMetrics;
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Command or configuration update received over the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Profile every service with the given profile type.
    TriggerProfile(ProfileType),
    /// Configuration pushed by the control center, to be applied to the
    /// application.
    ConfigUpdated { topic: String, data: Value },
}

pub struct ControlChannel {
    endpoint: Url,
    auth: Arc<dyn AuthProvider>,
    reconnect_interval: Duration,
    events: mpsc::Sender<ControlEvent>,
    closing: Arc<AtomicBool>,
    reconnecting: AtomicBool,
    metrics: AgentMetrics,
}

impl ControlChannel {
    pub fn new(
        icc_url: &Url,
        application_id: &str,
        auth: Arc<dyn AuthProvider>,
        reconnect_interval: Duration,
        events: mpsc::Sender<ControlEvent>,
        closing: Arc<AtomicBool>,
        metrics: AgentMetrics,
    ) -> Result<Self, crate::error::IccError> {
        let mut base = icc_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let endpoint = base.join(&format!("api/updates/applications/{application_id}"))?;
        let endpoint = Url::parse(&to_ws_url(endpoint.as_str()))?;

        Ok(Self {
            endpoint,
            auth,
            reconnect_interval,
            events,
            closing,
            reconnecting: AtomicBool::new(false),
            metrics,
        })
    }

    /// Dial, dispatch and redial until the agent closes.
    pub async fn run(self) {
        info!(endpoint = %self.endpoint, "Starting control channel");

        loop {
            if self.closing.load(Ordering::SeqCst) {
                break;
            }

            match self.connect_and_dispatch().await {
                Ok(()) => info!("Control channel closed by peer"),
                Err(e) => warn!(error = %e, "Control channel failed"),
            }

            if self.closing.load(Ordering::SeqCst) {
                break;
            }

            // reconnection is idempotent: a redial already being scheduled
            // means this pass has nothing to do
            if self.reconnecting.swap(true, Ordering::SeqCst) {
                continue;
            }
            tokio::time::sleep(self.reconnect_interval).await;
            self.reconnecting.store(false, Ordering::SeqCst);
            self.metrics.inc_control_reconnects();
        }

        info!("Control channel stopped");
    }

    async fn connect_and_dispatch(&self) -> Result<()> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .context("invalid control channel endpoint")?;
        let headers = self
            .auth
            .authorization_headers()
            .await
            .context("auth provider failed")?;
        request.headers_mut().extend(headers);

        let (socket, _) = connect_async(request)
            .await
            .context("control channel dial failed")?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::text(
            json!({"command": "subscribe", "topic": "/config"}).to_string(),
        ))
        .await
        .context("failed to send subscribe")?;

        let first = match stream.next().await {
            Some(frame) => frame.context("subscribe ack read failed")?,
            None => bail!("connection closed before subscribe ack"),
        };
        if !is_ack(&first) {
            bail!("subscribe was not acknowledged");
        }
        info!("Control channel subscribed to configuration updates");

        while let Some(frame) = stream.next().await {
            if self.closing.load(Ordering::SeqCst) {
                return Ok(());
            }
            match frame.context("control channel read failed")? {
                Message::Text(text) => {
                    if let Some(event) = parse_frame(text.as_str()) {
                        if self.events.send(event).await.is_err() {
                            debug!("Control event channel closed");
                            return Ok(());
                        }
                    }
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }

        Ok(())
    }
}

fn to_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

fn is_ack(message: &Message) -> bool {
    match message {
        Message::Text(text) => serde_json::from_str::<Value>(text.as_str())
            .ok()
            .map(|frame| frame.get("command").and_then(Value::as_str) == Some("ack"))
            .unwrap_or(false),
        _ => false,
    }
}

/// Interpret one control frame; unknown payloads yield `None` and are
/// ignored.
fn parse_frame(text: &str) -> Option<ControlEvent> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            debug!("Ignoring unparseable control frame");
            return None;
        }
    };

    match frame.get("command").and_then(Value::as_str) {
        Some("trigger-flamegraph") => return Some(ControlEvent::TriggerProfile(ProfileType::Cpu)),
        Some("trigger-heapprofile") => {
            return Some(ControlEvent::TriggerProfile(ProfileType::Heap))
        }
        _ => {}
    }

    if frame.get("type").and_then(Value::as_str) == Some("config-updated") {
        let topic = frame
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = frame.get("data").cloned().unwrap_or(Value::Null);
        return Some(ControlEvent::ConfigUpdated { topic, data });
    }

    debug!("Ignoring unrecognized control frame");
    None
}
