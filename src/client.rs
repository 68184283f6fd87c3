/// HTTP client for the controller, used by the watchdog and the detectors.
///
/// Every call carries the configured timeout. Anything other than a
/// well-formed success response is an error; callers decide whether that
/// means "inhibited" (watchdog) or "log and move on" (detectors).
use crate::config::AuthConfig;
use crate::controller::{HeartbeatResponse, InhibitRequest, InhibitResponse, StatusResponse};
use crate::error::GuardianError;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
    token: Option<String>,
}

impl ControllerClient {
    pub fn new(base_url: &str, timeout: Duration, auth: &AuthConfig) -> Result<Self, GuardianError> {
        // No idle connection reuse: every poll has to reach a live controller.
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| GuardianError::Unreachable(format!("http client error: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: auth.header.clone(),
            token: auth.secret().map(str::to_string),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /health`; succeeds only on a 2xx with `{"ok": true}`.
    pub async fn health(&self) -> Result<(), GuardianError> {
        let resp = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .map_err(unreachable)?;
        let body: serde_json::Value = decode(resp).await?;
        if body.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            Ok(())
        } else {
            Err(GuardianError::Unreachable(format!(
                "unexpected health payload: {body}"
            )))
        }
    }

    /// `POST /heartbeat` announcing `agent`. Returns the identity the controller recorded.
    pub async fn heartbeat(&self, agent: &str) -> Result<String, GuardianError> {
        let resp = self
            .http
            .post(self.url("/heartbeat"))
            .json(&serde_json::json!({ "source": agent }))
            .send()
            .await
            .map_err(unreachable)?;
        let body: HeartbeatResponse = decode(resp).await?;
        Ok(body.agent)
    }

    pub async fn status(&self) -> Result<StatusResponse, GuardianError> {
        let resp = self
            .http
            .get(self.url("/status"))
            .send()
            .await
            .map_err(unreachable)?;
        decode(resp).await
    }

    /// Whether the controller currently reports the workload as inhibited.
    /// A payload without an `inhibited` field is an error, never "false".
    pub async fn is_inhibited(&self) -> Result<bool, GuardianError> {
        Ok(self.status().await?.inhibited)
    }

    /// `POST /inhibit`, sending the shared secret when one is configured.
    pub async fn set_inhibit(
        &self,
        inhibit: bool,
        reason: Option<&str>,
    ) -> Result<bool, GuardianError> {
        let mut request = self.http.post(self.url("/inhibit")).json(&InhibitRequest {
            inhibit,
            reason: reason.map(str::to_string),
        });
        if let Some(token) = &self.token {
            request = request.header(self.auth_header.as_str(), token.as_str());
        }
        let resp = request.send().await.map_err(unreachable)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(GuardianError::Unauthorized);
        }
        let body: InhibitResponse = decode(resp).await?;
        Ok(body.inhibited)
    }
}

fn unreachable(e: reqwest::Error) -> GuardianError {
    GuardianError::Unreachable(e.to_string())
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, GuardianError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(GuardianError::Unreachable(format!(
            "controller returned {status}"
        )));
    }
    resp.json::<T>()
        .await
        .map_err(|e| GuardianError::Unreachable(format!("malformed controller response: {e}")))
}

/// Best-effort violation reporting for detectors.
///
/// A failed report is logged and swallowed: the detector still answers its
/// own caller with the violation error.
#[derive(Debug, Clone)]
pub struct ViolationReporter {
    client: ControllerClient,
}

impl ViolationReporter {
    pub fn new(client: ControllerClient) -> Self {
        Self { client }
    }

    /// Ask the controller to inhibit. Returns whether the controller confirmed it.
    pub async fn report(&self, source: &str, reason: &str) -> bool {
        match self.client.set_inhibit(true, Some(reason)).await {
            Ok(inhibited) => {
                tracing::warn!(source, reason, inhibited, "inhibit triggered");
                inhibited
            }
            Err(e) => {
                tracing::error!(
                    source,
                    reason,
                    error = %e,
                    controller = %self.client.base_url(),
                    "failed to notify controller of violation"
                );
                false
            }
        }
    }
}
