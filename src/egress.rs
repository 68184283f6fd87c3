/// Egress allow-list gateway.
///
/// The workload sends outbound HTTP through `POST /fetch`. Requests to hosts
/// on the allow-list are forwarded; anything else is refused with 403 and
/// reported to the controller as a violation. Reporting is best-effort and
/// never changes the answer the caller gets.
use crate::client::{ControllerClient, ViolationReporter};
use crate::config::GuardianConfig;
use crate::error::GuardianError;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

const TRUNCATION_MARKER: &str = "...(truncated)";
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Deserialize, Serialize)]
pub struct FetchRequest {
    /// Missing is treated like any other unparseable URL.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub text: String,
}

#[derive(Clone)]
pub struct EgressGateway {
    allowed: Arc<BTreeSet<String>>,
    http: reqwest::Client,
    reporter: ViolationReporter,
    max_body_chars: usize,
}

impl EgressGateway {
    pub fn new(
        allowed_domains: &[String],
        fetch_timeout: Duration,
        max_body_chars: usize,
        reporter: ViolationReporter,
    ) -> Result<Self, GuardianError> {
        let allowed: Arc<BTreeSet<String>> = Arc::new(
            allowed_domains
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        );

        // Redirects are followed only while they stay on allowed hosts.
        let redirect_allowed = Arc::clone(&allowed);
        let policy = redirect::Policy::custom(move |attempt| {
            let host = attempt.url().host_str().map(str::to_ascii_lowercase);
            match host {
                Some(h) if redirect_allowed.contains(&h) => {
                    if attempt.previous().len() >= MAX_REDIRECTS {
                        attempt.error("too many redirects")
                    } else {
                        attempt.follow()
                    }
                }
                other => {
                    tracing::warn!(host = ?other, "not following redirect to non-allowed host");
                    attempt.stop()
                }
            }
        });

        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .redirect(policy)
            .build()
            .map_err(|e| GuardianError::Upstream(format!("http client error: {e}")))?;

        Ok(Self {
            allowed,
            http,
            reporter,
            max_body_chars,
        })
    }

    pub fn from_config(config: &GuardianConfig) -> Result<Self, GuardianError> {
        let client = ControllerClient::new(
            &config.controller.url,
            config.controller.notify_timeout(),
            &config.auth,
        )?;
        Self::new(
            &config.egress.allowed_domains,
            config.egress.fetch_timeout(),
            config.egress.max_body_chars,
            ViolationReporter::new(client),
        )
    }

    /// Allowed hosts, sorted.
    pub fn allowed_domains(&self) -> Vec<String> {
        self.allowed.iter().cloned().collect()
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.allowed.contains(&host.to_ascii_lowercase())
    }

    /// Enforce the allow-list, then forward the request.
    pub async fn fetch(&self, req: FetchRequest) -> Result<FetchResponse, GuardianError> {
        let (url, host) = parse_target(&req.url)?;

        if !self.is_allowed(&host) {
            tracing::warn!(host = %host, url = %req.url, "blocked egress to forbidden domain");
            self.reporter
                .report("egress", &format!("Outbound to forbidden domain: {host}"))
                .await;
            return Err(GuardianError::Forbidden { host });
        }

        let method = Method::from_bytes(req.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| GuardianError::BadRequest(format!("Invalid method: {}", req.method)))?;
        let headers = build_headers(req.headers.as_ref())?;

        tracing::info!(%method, host = %host, "forwarding request");
        let mut request = self.http.request(method, url).headers(headers);
        if let Some(body) = req.body {
            request = request.body(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| GuardianError::Upstream(e.to_string()))?;
        let status_code = resp.status().as_u16();
        let headers = flatten_headers(resp.headers());
        let text = read_capped(resp, self.max_body_chars).await?;

        Ok(FetchResponse {
            status_code,
            headers,
            text,
        })
    }
}

/// Read the upstream body only as far as needed to fill `max_chars`.
///
/// A char is at most 4 bytes, so `4 * max_chars + 4` bytes always decode to
/// more than `max_chars` chars when the body is longer; a char split at the
/// cut lands past the truncation point.
async fn read_capped(mut resp: reqwest::Response, max_chars: usize) -> Result<String, GuardianError> {
    let limit = max_chars.saturating_mul(4).saturating_add(4);
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| GuardianError::Upstream(e.to_string()))?
    {
        let room = limit - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= limit {
            tracing::debug!(limit, "upstream body cut off at read limit");
            break;
        }
    }
    Ok(truncate_text(&String::from_utf8_lossy(&buf), max_chars))
}

/// Parse an outbound URL and return it with its lowercased hostname.
pub fn parse_target(raw: &str) -> Result<(Url, String), GuardianError> {
    let invalid = || GuardianError::BadRequest("Invalid URL".to_string());
    let url = Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_ascii_lowercase)
        .ok_or_else(invalid)?;
    Ok((url, host))
}

fn build_headers(raw: Option<&HashMap<String, String>>) -> Result<HeaderMap, GuardianError> {
    let mut headers = HeaderMap::new();
    for (name, value) in raw.into_iter().flatten() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| GuardianError::BadRequest(format!("Invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| GuardianError::BadRequest(format!("Invalid value for header {name}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Collapse a header map into name → value, joining repeated headers with ", ".
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Cut `text` to at most `max_chars` characters, appending a marker when cut.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &text[..idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

pub fn router(gateway: EgressGateway) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fetch", post(fetch))
        .with_state(gateway)
}

pub async fn run(config: &GuardianConfig) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = EgressGateway::from_config(config)?;
    tracing::info!(allowed = ?gateway.allowed_domains(), "egress gateway policy loaded");
    crate::serve::run("egress", &config.egress.host, config.egress.port, router(gateway)).await?;
    Ok(())
}

async fn health(State(gateway): State<EgressGateway>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "allowed_domains": gateway.allowed_domains(),
    }))
}

async fn fetch(
    State(gateway): State<EgressGateway>,
    body: Bytes,
) -> Result<Json<FetchResponse>, GuardianError> {
    let req: FetchRequest = serde_json::from_slice(&body)
        .map_err(|e| GuardianError::BadRequest(format!("invalid fetch body: {e}")))?;
    gateway.fetch(req).await.map(Json)
}
