//! HTTP client for the Infrastructure Control Center
//!
//! Stateless except for the base url; every request fetches fresh
//! authorization headers from the auth provider.

use crate::error::IccError;
use crate::models::{AlertRef, ProfileType, ProfilerState};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Provides fresh authorization headers for outbound requests.
///
/// Called on every request; callers must not cache the result, so token
/// refresh in the provider is picked up immediately.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authorization_headers(&self) -> anyhow::Result<HeaderMap>;
}

/// Auth provider carrying a static bearer token, or nothing at all.
pub struct BearerTokenProvider {
    token: Option<String>,
}

impl BearerTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthProvider for BearerTokenProvider {
    async fn authorization_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("token is not a valid header value")?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

/// Health-signal batch payload for `POST /signals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalsPayload {
    pub application_id: String,
    pub runtime_id: String,
    pub batch_started_at: i64,
    /// `serviceId -> signal kind -> series`.
    pub signals: BTreeMap<String, BTreeMap<String, SignalSeries>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSeries {
    pub options: SignalOptions,
    /// `workerId -> timestamped values`.
    pub workers: BTreeMap<String, WorkerSeries>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap_total: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSeries {
    pub values: Vec<(i64, f64)>,
}

#[derive(Debug, Deserialize)]
struct SignalsResponse {
    #[serde(default)]
    alerts: Vec<AlertRef>,
}

/// A point-in-time view of one worker's health, carried in alert payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub worker_id: String,
    pub elu: f64,
    pub heap_used: u64,
    pub heap_total: u64,
    pub unhealthy: bool,
    pub timestamp: i64,
}

/// Alert payload for `POST /alerts` (v1 scaler only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub application_id: String,
    pub alert: AlertBody,
    pub health_history: Vec<HealthSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertBody {
    pub id: String,
    pub application: String,
    pub service: String,
    pub current_health: HealthSnapshot,
    pub unhealthy: bool,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct AlertResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FlamegraphResponse {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachAlertsBody<'a> {
    alert_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatesPayload<'a> {
    application_id: &'a str,
    pod_id: &'a str,
    expires_in: u64,
    states: &'a [ProfilerState],
}

/// Endpoint surface of the control center, kept behind a trait so the loops
/// can be exercised against in-process doubles.
#[async_trait]
pub trait ControlCenter: Send + Sync {
    /// Flush one health-signal batch; the response may carry alerts to
    /// profile.
    async fn post_signals(&self, payload: &SignalsPayload) -> Result<Vec<AlertRef>, IccError>;

    /// Raise an alert; returns the alert id assigned by the control center.
    async fn post_alert(&self, payload: &AlertPayload) -> Result<String, IccError>;

    /// Upload raw profile bytes, optionally bound to an alert; returns the
    /// flamegraph id.
    async fn upload_flamegraph(
        &self,
        service_id: &str,
        profile_type: ProfileType,
        alert_id: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String, IccError>;

    /// Bind additional alerts to an uploaded flamegraph.
    async fn attach_alerts(
        &self,
        flamegraph_id: &str,
        alert_ids: &[String],
    ) -> Result<(), IccError>;

    /// Report the current profiler states.
    async fn post_profiler_states(
        &self,
        states: &[ProfilerState],
        expires_in_millis: u64,
    ) -> Result<(), IccError>;
}

/// reqwest-backed control center client.
pub struct IccClient {
    http: reqwest::Client,
    base_url: Url,
    pod_id: String,
    application_id: String,
    auth: std::sync::Arc<dyn AuthProvider>,
}

impl IccClient {
    pub fn new(
        base_url: &str,
        pod_id: impl Into<String>,
        application_id: impl Into<String>,
        auth: std::sync::Arc<dyn AuthProvider>,
    ) -> Result<Self, IccError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        Ok(Self {
            http,
            base_url,
            pod_id: pod_id.into(),
            application_id: application_id.into(),
            auth,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, IccError> {
        Ok(self.base_url.join(path)?)
    }

    async fn headers(&self) -> Result<HeaderMap, IccError> {
        self.auth
            .authorization_headers()
            .await
            .map_err(|e| IccError::Auth(e.to_string()))
    }

    /// Resolve a response into its body text, logging non-2xx bodies.
    async fn check(response: reqwest::Response) -> Result<String, IccError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %body, "Control center request failed");
            return Err(IccError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl ControlCenter for IccClient {
    async fn post_signals(&self, payload: &SignalsPayload) -> Result<Vec<AlertRef>, IccError> {
        let url = self.endpoint("signals")?;
        let response = self
            .http
            .post(url)
            .headers(self.headers().await?)
            .json(payload)
            .send()
            .await?;

        let body = Self::check(response).await?;
        let parsed: SignalsResponse = serde_json::from_str(&body).unwrap_or(SignalsResponse {
            alerts: Vec::new(),
        });
        Ok(parsed.alerts)
    }

    async fn post_alert(&self, payload: &AlertPayload) -> Result<String, IccError> {
        let url = self.endpoint("alerts")?;
        let response = self
            .http
            .post(url)
            .headers(self.headers().await?)
            .json(payload)
            .send()
            .await?;

        let body = Self::check(response).await?;
        let parsed: AlertResponse =
            serde_json::from_str(&body).map_err(|e| IccError::UnexpectedStatus {
                status: 200,
                body: format!("unparseable alert response: {e}"),
            })?;
        Ok(parsed.id)
    }

    async fn upload_flamegraph(
        &self,
        service_id: &str,
        profile_type: ProfileType,
        alert_id: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String, IccError> {
        let mut url = self.endpoint(&format!(
            "pods/{}/services/{}/flamegraph",
            self.pod_id, service_id
        ))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("profileType", profile_type.as_str());
            if let Some(alert_id) = alert_id {
                query.append_pair("alertId", alert_id);
            }
        }

        let response = self
            .http
            .post(url)
            .headers(self.headers().await?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        let body = Self::check(response).await?;
        let parsed: FlamegraphResponse =
            serde_json::from_str(&body).map_err(|e| IccError::UnexpectedStatus {
                status: 200,
                body: format!("unparseable flamegraph response: {e}"),
            })?;
        Ok(parsed.id)
    }

    async fn attach_alerts(
        &self,
        flamegraph_id: &str,
        alert_ids: &[String],
    ) -> Result<(), IccError> {
        let url = self.endpoint(&format!("flamegraphs/{flamegraph_id}/alerts"))?;
        let response = self
            .http
            .post(url)
            .headers(self.headers().await?)
            .json(&AttachAlertsBody { alert_ids })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND && body.contains("Route POST") {
            // a control center predating the attach endpoint
            return Err(IccError::MultipleAlertsUnsupported);
        }
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %body, "Control center request failed");
            return Err(IccError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn post_profiler_states(
        &self,
        states: &[ProfilerState],
        expires_in_millis: u64,
    ) -> Result<(), IccError> {
        let url = self.endpoint("flamegraphs/states")?;
        let payload = StatesPayload {
            application_id: &self.application_id,
            pod_id: &self.pod_id,
            expires_in: expires_in_millis,
            states,
        };
        let response = self
            .http
            .post(url)
            .headers(self.headers().await?)
            .json(&payload)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}
