/// Liveness registry: agent identity → last time a heartbeat was received.
///
/// Timestamps are taken at receipt on the controller, so they can never move
/// backwards for an agent. Entries are never evicted; staleness is derived
/// from the age at read time.
use crate::error::GuardianError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// Longest accepted agent identity, in bytes.
pub const MAX_AGENT_ID_LEN: usize = 128;

#[derive(Default)]
pub struct HeartbeatRegistry {
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat for `agent` at the current time.
    pub fn record(&self, agent: &str) -> Instant {
        let now = Instant::now();
        let mut seen = self.last_seen.lock();
        let entry = seen.entry(agent.to_string()).or_insert(now);
        if now > *entry {
            *entry = now;
        }
        *entry
    }

    /// Seconds since each agent's last heartbeat, computed now.
    pub fn ages(&self) -> BTreeMap<String, f64> {
        let now = Instant::now();
        self.last_seen
            .lock()
            .iter()
            .map(|(agent, seen)| (agent.clone(), now.duration_since(*seen).as_secs_f64()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.last_seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pick the agent identity from a heartbeat payload.
///
/// `source` wins over `agent` when both are present. Blank or missing values
/// fall back to `fallback`. Identities that are too long or contain control
/// characters are rejected.
pub fn resolve_agent(
    source: Option<&str>,
    agent: Option<&str>,
    fallback: &str,
) -> Result<String, GuardianError> {
    let candidate = [source, agent]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(fallback);

    if candidate.len() > MAX_AGENT_ID_LEN {
        return Err(GuardianError::BadRequest(format!(
            "agent id longer than {MAX_AGENT_ID_LEN} bytes"
        )));
    }
    if candidate.chars().any(char::is_control) {
        return Err(GuardianError::BadRequest(
            "agent id contains control characters".to_string(),
        ));
    }
    Ok(candidate.to_string())
}
