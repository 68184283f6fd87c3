/// Honeytoken trap.
///
/// A decoy secret is planted on disk where the workload can read it. Any
/// traffic posted to `/ingest` that contains the decoy is proof the workload
/// is exfiltrating what it found, and triggers an inhibit.
use crate::client::{ControllerClient, ViolationReporter};
use crate::config::GuardianConfig;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Characters of the decoy shown by `/health` before the redaction marker.
const VISIBLE_PREFIX: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum DecoyError {
    #[error("failed to create decoy directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write decoy {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read decoy {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoy file {} is empty", path.display())]
    Empty { path: PathBuf },
}

fn generate_decoy() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string().to_ascii_uppercase();
    format!("FAKE_API_KEY={id}")
}

/// Return the decoy stored at `path`, creating it first if absent.
///
/// Creation goes through a temp file and `hard_link`, which refuses to
/// replace an existing file, so concurrent first starts all end up reading
/// whichever value landed first.
pub fn load_or_create_decoy(path: &Path) -> Result<String, DecoyError> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| DecoyError::CreateDir {
        path: dir.to_path_buf(),
        source: e,
    })?;

    if !path.exists() {
        create_if_absent(path, dir, &generate_decoy())?;
    }

    let contents = std::fs::read_to_string(path).map_err(|e| DecoyError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let decoy = contents.trim();
    if decoy.is_empty() {
        return Err(DecoyError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(decoy.to_string())
}

fn create_if_absent(path: &Path, dir: &Path, value: &str) -> Result<(), DecoyError> {
    let tmp = dir.join(format!(
        ".decoy.tmp.{}.{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    let write_err = |source| DecoyError::Write {
        path: path.to_path_buf(),
        source,
    };

    std::fs::write(&tmp, format!("{value}\n")).map_err(write_err)?;
    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);

    match linked {
        Ok(()) => {
            tracing::info!(path = %path.display(), "generated new decoy");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %path.display(), "decoy created concurrently, reusing it");
            Ok(())
        }
        Err(e) => {
            // Filesystems without hard links: exclusive create instead.
            tracing::debug!(error = %e, "hard_link unavailable, using create_new");
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => file.write_all(format!("{value}\n").as_bytes()).map_err(write_err),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => Err(write_err(e)),
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub matched: bool,
}

#[derive(Clone)]
pub struct HoneytokenTrap {
    decoy: Arc<str>,
    reporter: ViolationReporter,
}

impl HoneytokenTrap {
    /// `decoy` must be non-empty; `load_or_create_decoy` guarantees that.
    pub fn new(decoy: &str, reporter: ViolationReporter) -> Self {
        Self {
            decoy: Arc::from(decoy),
            reporter,
        }
    }

    pub fn from_config(config: &GuardianConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let decoy = load_or_create_decoy(&config.honeytoken.decoy_file)?;
        let client = ControllerClient::new(
            &config.controller.url,
            config.controller.notify_timeout(),
            &config.auth,
        )?;
        Ok(Self::new(&decoy, ViolationReporter::new(client)))
    }

    /// Decoy prefix safe to show in health output.
    pub fn redacted(&self) -> String {
        let prefix: String = self.decoy.chars().take(VISIBLE_PREFIX).collect();
        format!("{prefix}...(redacted)")
    }

    /// Plain substring check of the decoy against raw bytes.
    pub fn contains_decoy(&self, data: &[u8]) -> bool {
        let needle = self.decoy.as_bytes();
        !needle.is_empty() && data.windows(needle.len()).any(|w| w == needle)
    }

    /// Inspect ingested traffic; report a match to the controller.
    pub async fn ingest(&self, data: &[u8]) -> bool {
        tracing::info!(bytes = data.len(), "ingest received");
        if !self.contains_decoy(data) {
            return false;
        }
        tracing::warn!("honeytoken observed in egress");
        self.reporter
            .report("honeytoken", "Honeytoken observed in egress")
            .await;
        true
    }
}

pub fn router(trap: HoneytokenTrap) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .with_state(trap)
}

pub async fn run(config: &GuardianConfig) -> Result<(), Box<dyn std::error::Error>> {
    let trap = HoneytokenTrap::from_config(config)?;
    tracing::info!(
        decoy_file = %config.honeytoken.decoy_file.display(),
        watching_for = %trap.redacted(),
        "honeytoken trap armed"
    );
    crate::serve::run(
        "honeytoken",
        &config.honeytoken.host,
        config.honeytoken.port,
        router(trap),
    )
    .await?;
    Ok(())
}

async fn health(State(trap): State<HoneytokenTrap>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "watching_for": trap.redacted() }))
}

async fn ingest(State(trap): State<HoneytokenTrap>, body: Bytes) -> Json<IngestResponse> {
    let matched = trap.ingest(&body).await;
    Json(IngestResponse { ok: true, matched })
}
