/// Error taxonomy shared by the controller, the detectors and the controller client.
///
/// Each variant maps onto one HTTP status so axum handlers can return
/// `Result<Json<_>, GuardianError>` directly. The body mirrors the
/// `{"detail": "..."}` shape the dashboard already understands.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    /// Missing or wrong shared secret on a protected call.
    #[error("unauthorized")]
    Unauthorized,
    /// Malformed request (unparseable URL, invalid method, bad agent id).
    #[error("{0}")]
    BadRequest(String),
    /// Destination host is not on the allow-list.
    #[error("Domain not allowed: {host}")]
    Forbidden { host: String },
    /// Transport failure talking to a downstream dependency.
    #[error("Upstream error: {0}")]
    Upstream(String),
    /// The controller could not be contacted, or answered with something unusable.
    #[error("controller unreachable: {0}")]
    Unreachable(String),
}

impl GuardianError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GuardianError::Unauthorized => StatusCode::UNAUTHORIZED,
            GuardianError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GuardianError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GuardianError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GuardianError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GuardianError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "detail": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(GuardianError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GuardianError::BadRequest("Invalid URL".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GuardianError::Forbidden {
                host: "example.com".into()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GuardianError::Upstream("reset".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GuardianError::Unreachable("refused".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_forbidden_message_names_host() {
        let err = GuardianError::Forbidden {
            host: "example.com".into(),
        };
        assert_eq!(err.to_string(), "Domain not allowed: example.com");
    }

    #[tokio::test]
    async fn test_into_response_carries_detail_body() {
        let resp = GuardianError::Upstream("connection reset".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["detail"], "Upstream error: connection reset");
    }
}
