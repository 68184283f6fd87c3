use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration loaded from guardian.toml, then overridden by
/// environment variables, then by CLI flags.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardianConfig {
    pub controller: ControllerConfig,
    pub auth: AuthConfig,
    pub watchdog: WatchdogConfig,
    pub workload: WorkloadConfig,
    pub egress: EgressConfig,
    pub honeytoken: HoneytokenConfig,
}

/// Where the controller listens, and how clients reach it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Base URL clients (watchdog, detectors) use to reach the controller.
    pub url: String,
    pub host: String,
    pub port: u16,
    /// Delay after which an explicit inhibit reverts on its own. 0 disables.
    pub auto_clear_secs: f64,
    /// Identity recorded for heartbeats that do not name an agent.
    pub default_agent: String,
    /// Timeout for detector → controller violation reports.
    pub notify_timeout_secs: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for mutating calls. Empty disables the check.
    pub token: String,
    pub header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Agent identity announced in heartbeats.
    pub agent: String,
    pub interval_secs: f64,
    pub request_timeout_secs: f64,
    pub startup_grace_secs: f64,
    pub grace_poll_secs: f64,
    pub stop_timeout_secs: f64,
    pub status_file: Option<PathBuf>,
}

/// The supervised workload command line.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EgressConfig {
    pub host: String,
    pub port: u16,
    pub allowed_domains: Vec<String>,
    pub fetch_timeout_secs: f64,
    pub max_body_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HoneytokenConfig {
    pub host: String,
    pub port: u16,
    pub decoy_file: PathBuf,
}

// --- Default implementations ---

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            auto_clear_secs: 0.0,
            default_agent: "unknown".to_string(),
            notify_timeout_secs: 2.0,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            header: "x-guardian-auth".to_string(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            agent: "guarded_ai".to_string(),
            interval_secs: 2.0,
            request_timeout_secs: 1.5,
            startup_grace_secs: 8.0,
            grace_poll_secs: 0.5,
            stop_timeout_secs: 3.0,
            status_file: None,
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            command: "sleep".to_string(),
            args: vec!["infinity".to_string()],
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9100,
            allowed_domains: vec!["httpbin.org".to_string()],
            fetch_timeout_secs: 5.0,
            max_body_chars: 2000,
        }
    }
}

impl Default for HoneytokenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            decoy_file: PathBuf::from("decoys/fake_key.txt"),
        }
    }
}

// --- Derived values ---

/// Convert a validated seconds value into a Duration.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

impl ControllerConfig {
    pub fn auto_clear(&self) -> Option<Duration> {
        (self.auto_clear_secs > 0.0).then(|| secs(self.auto_clear_secs))
    }

    pub fn notify_timeout(&self) -> Duration {
        secs(self.notify_timeout_secs)
    }
}

impl AuthConfig {
    /// The configured secret, or `None` when auth is disabled.
    pub fn secret(&self) -> Option<&str> {
        let token = self.token.trim();
        (!token.is_empty()).then_some(token)
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        secs(self.startup_grace_secs)
    }

    pub fn grace_poll(&self) -> Duration {
        secs(self.grace_poll_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        secs(self.stop_timeout_secs)
    }
}

impl EgressConfig {
    pub fn fetch_timeout(&self) -> Duration {
        secs(self.fetch_timeout_secs)
    }
}

/// Split a comma-separated host list, trimming and lowercasing each entry.
pub fn parse_domain_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

// --- Loading ---

impl GuardianConfig {
    /// Load the config file (missing file means defaults), apply environment
    /// overrides, and validate the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides. `lookup` returns the raw value for a
    /// variable name, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        env.string("OOBSC_URL", &mut self.controller.url);
        env.string("CONTROLLER_HOST", &mut self.controller.host);
        env.parse("CONTROLLER_PORT", &mut self.controller.port)?;
        env.parse("INHIBIT_AUTO_CLEAR_SEC", &mut self.controller.auto_clear_secs)?;
        env.string("DEFAULT_AGENT", &mut self.controller.default_agent);
        env.parse("NOTIFY_TIMEOUT_SEC", &mut self.controller.notify_timeout_secs)?;

        env.string("AUTH_TOKEN", &mut self.auth.token);
        env.string("AUTH_HEADER", &mut self.auth.header);

        env.string("HEARTBEAT_SOURCE", &mut self.watchdog.agent);
        env.parse("HB_INTERVAL_SEC", &mut self.watchdog.interval_secs)?;
        env.parse("REQ_TIMEOUT_SEC", &mut self.watchdog.request_timeout_secs)?;
        env.parse("STARTUP_GRACE_SEC", &mut self.watchdog.startup_grace_secs)?;
        env.parse("GRACE_POLL_SEC", &mut self.watchdog.grace_poll_secs)?;
        env.parse("STOP_TIMEOUT_SEC", &mut self.watchdog.stop_timeout_secs)?;
        if let Some(path) = lookup("WATCHDOG_STATUS_FILE") {
            self.watchdog.status_file = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }

        if let Some(raw) = lookup("ALLOWED_DOMAINS") {
            self.egress.allowed_domains = parse_domain_list(&raw);
        }
        env.parse("FETCH_TIMEOUT_SEC", &mut self.egress.fetch_timeout_secs)?;
        env.string("EGRESS_HOST", &mut self.egress.host);
        env.parse("EGRESS_PORT", &mut self.egress.port)?;

        env.string("HONEYPOT_HOST", &mut self.honeytoken.host);
        env.parse("HONEYPOT_PORT", &mut self.honeytoken.port)?;
        if let Some(path) = lookup("DECOY_FILE") {
            self.honeytoken.decoy_file = PathBuf::from(path);
        }

        Ok(())
    }

    /// Reject values that would make a timer or a timeout meaningless.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let durations = [
            ("controller.auto_clear_secs", self.controller.auto_clear_secs, true),
            ("controller.notify_timeout_secs", self.controller.notify_timeout_secs, false),
            ("watchdog.interval_secs", self.watchdog.interval_secs, false),
            ("watchdog.request_timeout_secs", self.watchdog.request_timeout_secs, false),
            ("watchdog.startup_grace_secs", self.watchdog.startup_grace_secs, true),
            ("watchdog.grace_poll_secs", self.watchdog.grace_poll_secs, false),
            ("watchdog.stop_timeout_secs", self.watchdog.stop_timeout_secs, true),
            ("egress.fetch_timeout_secs", self.egress.fetch_timeout_secs, false),
        ];
        for (field, value, zero_ok) in durations {
            let bad = !value.is_finite() || value < 0.0 || (!zero_ok && value == 0.0);
            if bad || Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is not a usable duration in seconds"),
                });
            }
        }

        if self.workload.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "workload.command",
                reason: "must not be empty".to_string(),
            });
        }

        if self.auth.header.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth.header",
                reason: "must not be empty".to_string(),
            });
        }

        // Normalize so matching can stay a plain comparison.
        self.egress.allowed_domains = self
            .egress
            .allowed_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        self.controller.url = self.controller.url.trim_end_matches('/').to_string();

        Ok(())
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, name: &str, slot: &mut String) {
        if let Some(value) = (self.lookup)(name) {
            *slot = value;
        }
    }

    fn parse<T: FromStr>(&self, name: &'static str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = (self.lookup)(name) {
            *slot = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name, value })?;
        }
        Ok(())
    }
}

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
