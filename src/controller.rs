/// Out-of-band safety controller: the single authority for the inhibit flag.
///
/// Holds the inhibit cell and the heartbeat registry and exposes them over
/// HTTP. Reads are open; the only mutating call that matters for safety
/// (`POST /inhibit`) goes through the auth guard.
use crate::auth::AuthGuard;
use crate::config::GuardianConfig;
use crate::error::GuardianError;
use crate::heartbeat::{resolve_agent, HeartbeatRegistry};
use crate::inhibit::{InhibitCell, InhibitState};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub agent: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InhibitRequest {
    pub inhibit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InhibitResponse {
    pub inhibited: bool,
}

/// Snapshot returned by `GET /status`, computed at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub inhibited: bool,
    #[serde(default)]
    pub heartbeat_ages: BTreeMap<String, f64>,
    #[serde(default)]
    pub set_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_clear_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct Controller {
    inhibit: InhibitCell,
    heartbeats: Arc<HeartbeatRegistry>,
    auth: AuthGuard,
    default_agent: Arc<str>,
}

impl Controller {
    pub fn new(inhibit: InhibitCell, auth: AuthGuard, default_agent: &str) -> Self {
        Self {
            inhibit,
            heartbeats: Arc::new(HeartbeatRegistry::new()),
            auth,
            default_agent: Arc::from(default_agent),
        }
    }

    pub fn from_config(config: &GuardianConfig) -> Self {
        Self::new(
            InhibitCell::new(config.controller.auto_clear()),
            AuthGuard::from_config(&config.auth),
            &config.controller.default_agent,
        )
    }

    pub fn health(&self) -> serde_json::Value {
        serde_json::json!({ "ok": true })
    }

    /// Record a heartbeat at receipt time and return the resolved identity.
    pub fn record_heartbeat(&self, req: &HeartbeatRequest) -> Result<String, GuardianError> {
        let agent = resolve_agent(
            req.source.as_deref(),
            req.agent.as_deref(),
            &self.default_agent,
        )?;
        self.heartbeats.record(&agent);
        tracing::debug!(agent = %agent, "heartbeat recorded");
        Ok(agent)
    }

    pub fn status(&self) -> StatusResponse {
        let InhibitState {
            active,
            set_at,
            auto_clear_at,
            reason,
        } = self.inhibit.snapshot();
        StatusResponse {
            inhibited: active,
            heartbeat_ages: self.heartbeats.ages(),
            set_at: Some(set_at),
            auto_clear_at,
            reason,
        }
    }

    /// Replace the inhibit flag. Requires the shared secret when one is configured.
    pub fn set_inhibit(
        &self,
        active: bool,
        reason: Option<String>,
        caller_token: Option<&str>,
    ) -> Result<bool, GuardianError> {
        self.auth.check_token(caller_token)?;
        Ok(self.apply_inhibit(active, reason))
    }

    /// Write the flag for a caller that already passed the auth check.
    fn apply_inhibit(&self, active: bool, reason: Option<String>) -> bool {
        let state = self.inhibit.set(active, reason);
        if state.active {
            tracing::warn!(reason = ?state.reason, "workload INHIBITED");
        } else {
            tracing::info!("inhibit cleared");
        }
        state.active
    }
}

pub fn router(controller: Controller) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/heartbeat", post(heartbeat))
        .route("/status", get(status))
        .route("/inhibit", post(inhibit))
        .with_state(controller)
}

/// Run the controller until SIGINT/SIGTERM.
pub async fn run(config: &GuardianConfig) -> std::io::Result<()> {
    let controller = Controller::from_config(config);
    if controller.auth.is_enforced() {
        tracing::info!(header = %controller.auth.header_name(), "inhibit auth enforced");
    } else {
        tracing::warn!("no AUTH_TOKEN configured; POST /inhibit is open");
    }
    match controller.inhibit.auto_clear() {
        Some(delay) => tracing::warn!(
            delay_secs = delay.as_secs_f64(),
            "inhibit auto-clear enabled"
        ),
        None => tracing::info!("inhibit auto-clear disabled"),
    }

    crate::serve::run(
        "controller",
        &config.controller.host,
        config.controller.port,
        router(controller),
    )
    .await
}

async fn health(State(controller): State<Controller>) -> Json<serde_json::Value> {
    Json(controller.health())
}

async fn heartbeat(
    State(controller): State<Controller>,
    body: Bytes,
) -> Result<Json<HeartbeatResponse>, GuardianError> {
    let req: HeartbeatRequest = if body.iter().all(u8::is_ascii_whitespace) {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GuardianError::BadRequest(format!("invalid heartbeat body: {e}")))?
    };
    let agent = controller.record_heartbeat(&req)?;
    Ok(Json(HeartbeatResponse { ok: true, agent }))
}

async fn status(State(controller): State<Controller>) -> Json<StatusResponse> {
    Json(controller.status())
}

async fn inhibit(
    State(controller): State<Controller>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InhibitResponse>, GuardianError> {
    // Authenticate before looking at the body.
    controller.auth.check(&headers)?;
    let req: InhibitRequest = serde_json::from_slice(&body)
        .map_err(|e| GuardianError::BadRequest(format!("invalid inhibit body: {e}")))?;
    let inhibited = controller.apply_inhibit(req.inhibit, req.reason);
    Ok(Json(InhibitResponse { inhibited }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn open_controller() -> Controller {
        Controller::new(InhibitCell::new(None), AuthGuard::new("x-guardian-auth", None), "unknown")
    }

    fn secured_controller() -> Controller {
        Controller::new(
            InhibitCell::new(None),
            AuthGuard::new("x-guardian-auth", Some("s3cret".into())),
            "unknown",
        )
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<&str>,
        token: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("x-guardian-auth", token);
        }
        let req = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(open_controller());
        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_status_starts_not_inhibited() {
        let app = router(open_controller());
        let (status, body) = call(&app, "GET", "/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inhibited"], false);
        assert_eq!(body["heartbeatAges"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_heartbeat_with_source() {
        let app = router(open_controller());
        let (status, body) =
            call(&app, "POST", "/heartbeat", Some(r#"{"source":"guarded_ai"}"#), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"], "guarded_ai");
        assert_eq!(body["ok"], true);

        let (_, status_body) = call(&app, "GET", "/status", None, None).await;
        assert!(status_body["heartbeatAges"]["guarded_ai"].is_number());
    }

    #[tokio::test]
    async fn test_heartbeat_with_agent_field() {
        let app = router(open_controller());
        let (_, body) = call(&app, "POST", "/heartbeat", Some(r#"{"agent":"w1"}"#), None).await;
        assert_eq!(body["agent"], "w1");
    }

    #[tokio::test]
    async fn test_heartbeat_without_body_uses_fallback() {
        let app = router(open_controller());
        let (status, body) = call(&app, "POST", "/heartbeat", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"], "unknown");

        let (_, body) = call(&app, "POST", "/heartbeat", Some("{}"), None).await;
        assert_eq!(body["agent"], "unknown");
    }

    #[tokio::test]
    async fn test_heartbeat_needs_no_auth() {
        let app = router(secured_controller());
        let (status, _) = call(&app, "POST", "/heartbeat", Some(r#"{"source":"a"}"#), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_malformed_json() {
        let app = router(open_controller());
        let (status, body) = call(&app, "POST", "/heartbeat", Some("{not json"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("invalid heartbeat body"));
    }

    #[tokio::test]
    async fn test_inhibit_open_when_no_secret() {
        let app = router(open_controller());
        let (status, body) =
            call(&app, "POST", "/inhibit", Some(r#"{"inhibit":true}"#), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inhibited"], true);

        let (_, status_body) = call(&app, "GET", "/status", None, None).await;
        assert_eq!(status_body["inhibited"], true);
    }

    #[tokio::test]
    async fn test_inhibit_requires_secret_when_configured() {
        let app = router(secured_controller());

        let (status, _) = call(&app, "POST", "/inhibit", Some(r#"{"inhibit":true}"#), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(
            &app,
            "POST",
            "/inhibit",
            Some(r#"{"inhibit":true}"#),
            Some("wrong"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, body) = call(&app, "GET", "/status", None, None).await;
        assert_eq!(body["inhibited"], false, "rejected calls must not mutate state");

        let (status, body) = call(
            &app,
            "POST",
            "/inhibit",
            Some(r#"{"inhibit":true}"#),
            Some("s3cret"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inhibited"], true);
    }

    #[tokio::test]
    async fn test_unauthorized_before_body_validation() {
        let app = router(secured_controller());
        let (status, _) = call(&app, "POST", "/inhibit", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_inhibit_rejects_malformed_body() {
        let app = router(open_controller());
        let (status, _) = call(&app, "POST", "/inhibit", Some(r#"{"inhibit":"yes"}"#), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inhibit_idempotent_and_last_writer_wins() {
        let app = router(open_controller());
        for (value, expected) in [
            ("true", true),
            ("true", true),
            ("false", false),
            ("true", true),
            ("false", false),
        ] {
            let body = format!(r#"{{"inhibit":{value}}}"#);
            let (_, resp) = call(&app, "POST", "/inhibit", Some(&body), None).await;
            assert_eq!(resp["inhibited"], expected);
            let (_, status) = call(&app, "GET", "/status", None, None).await;
            assert_eq!(status["inhibited"], expected);
        }
    }

    #[tokio::test]
    async fn test_reason_exposed_in_status() {
        let app = router(open_controller());
        call(
            &app,
            "POST",
            "/inhibit",
            Some(r#"{"inhibit":true,"reason":"forbidden egress"}"#),
            None,
        )
        .await;
        let (_, body) = call(&app, "GET", "/status", None, None).await;
        assert_eq!(body["reason"], "forbidden egress");
        assert!(body["setAt"].is_string());
        assert!(body["autoClearAt"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_clear_when_armed() {
        let controller = Controller::new(
            InhibitCell::new(Some(Duration::from_secs(10))),
            AuthGuard::new("x-guardian-auth", None),
            "unknown",
        );
        let app = router(controller);
        call(&app, "POST", "/inhibit", Some(r#"{"inhibit":true}"#), None).await;
        let (_, body) = call(&app, "GET", "/status", None, None).await;
        assert_eq!(body["inhibited"], true);
        assert!(body["autoClearAt"].is_string());

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        let (_, body) = call(&app, "GET", "/status", None, None).await;
        assert_eq!(body["inhibited"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_age_strictly_increases() {
        let app = router(open_controller());
        call(&app, "POST", "/heartbeat", Some(r#"{"source":"a"}"#), None).await;

        let mut last = -1.0;
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let (_, body) = call(&app, "GET", "/status", None, None).await;
            let age = body["heartbeatAges"]["a"].as_f64().unwrap();
            assert!(age > last);
            last = age;
        }
    }

    #[tokio::test]
    async fn test_authorized_inhibit_applies_body_once_checked() {
        let controller = secured_controller();
        let app = router(controller.clone());
        let (status, body) = call(
            &app,
            "POST",
            "/inhibit",
            Some(r#"{"inhibit":true,"reason":"egress violation"}"#),
            Some("s3cret"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inhibited"], true);
        let snapshot = controller.status();
        assert!(snapshot.inhibited);
        assert_eq!(snapshot.reason.as_deref(), Some("egress violation"));

        let (status, _) = call(
            &app,
            "POST",
            "/inhibit",
            Some(r#"{"inhibit":false}"#),
            Some("wrong"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(controller.status().inhibited);
    }

    #[test]
    fn test_set_inhibit_direct_call_checks_token() {
        let controller = secured_controller();
        assert!(matches!(
            controller.set_inhibit(true, None, None),
            Err(GuardianError::Unauthorized)
        ));
        assert!(controller.set_inhibit(true, None, Some("s3cret")).unwrap());
        assert!(controller.status().inhibited);
    }
}
