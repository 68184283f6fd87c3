/// Shared-secret check for state-mutating controller calls.
///
/// Stateless: holds the header name and the optional configured secret.
/// With no secret configured every request passes.
use crate::config::AuthConfig;
use crate::error::GuardianError;
use axum::http::HeaderMap;

#[derive(Debug, Clone)]
pub struct AuthGuard {
    header: String,
    secret: Option<String>,
}

impl AuthGuard {
    pub fn new(header: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            header: header.into(),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.header.clone(), config.secret().map(str::to_string))
    }

    pub fn is_enforced(&self) -> bool {
        self.secret.is_some()
    }

    pub fn header_name(&self) -> &str {
        &self.header
    }

    /// The caller token carried by `headers`, if any.
    pub fn token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
    }

    /// Validate the caller's headers against the configured secret.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), GuardianError> {
        self.check_token(self.token(headers))
    }

    /// Validate a caller token against the configured secret.
    pub fn check_token(&self, supplied: Option<&str>) -> Result<(), GuardianError> {
        let Some(expected) = &self.secret else {
            return Ok(());
        };
        let supplied = supplied.unwrap_or("");
        if constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            tracing::warn!(header = %self.header, "rejected call with missing or wrong secret");
            Err(GuardianError::Unauthorized)
        }
    }
}

/// Equality that does not short-circuit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
