/// Fail-closed supervisor for the workload process.
///
/// Waits for the controller during a startup grace period, then polls
/// `/status` on a fixed interval. The workload runs only while the controller
/// is reachable and reports "not inhibited". Any failure to confirm that
/// (timeout, refusal, error status, malformed payload) stops the workload,
/// exactly like an explicit inhibit. A failed heartbeat alone never does.
use crate::client::ControllerClient;
use crate::config::WatchdogConfig;
use crate::process::{StopOutcome, SupervisedProcess};
use crate::status::{StatusData, StatusFile, WatchdogPhase};
use chrono::Utc;
use std::future::Future;
use tokio::sync::watch;
use tokio::time::Instant;

/// How the watchdog ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The controller never came up during startup grace; the workload never ran.
    FailClosed { reason: String },
    /// SIGINT/SIGTERM (or the caller's shutdown future) stopped the watchdog.
    Shutdown,
}

impl WatchdogOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            WatchdogOutcome::FailClosed { .. } => 1,
            WatchdogOutcome::Shutdown => 0,
        }
    }
}

pub struct Watchdog {
    client: ControllerClient,
    settings: WatchdogConfig,
    process: SupervisedProcess,
    status_file: Option<StatusFile>,
    phase: WatchdogPhase,
    last_reason: Option<String>,
    updates: watch::Sender<StatusData>,
}

impl Watchdog {
    pub fn new(client: ControllerClient, settings: WatchdogConfig, process: SupervisedProcess) -> Self {
        let status_file = settings.status_file.clone().map(StatusFile::new);
        let initial = StatusData {
            pid: std::process::id(),
            phase: WatchdogPhase::StartupGrace,
            agent: settings.agent.clone(),
            workload: process.state(),
            workload_pid: None,
            workload_starts: 0,
            last_reason: None,
            last_update: Utc::now(),
        };
        let (updates, _) = watch::channel(initial);
        Self {
            client,
            settings,
            process,
            status_file,
            phase: WatchdogPhase::StartupGrace,
            last_reason: None,
            updates,
        }
    }

    /// Observe phase and workload changes.
    pub fn subscribe(&self) -> watch::Receiver<StatusData> {
        self.updates.subscribe()
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.phase
    }

    /// Drive the state machine until fail-closed or `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> WatchdogOutcome
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.publish();

        let ready = tokio::select! {
            ready = self.startup_grace() => ready,
            _ = &mut shutdown => return self.shutdown().await,
        };
        if !ready {
            let reason = format!(
                "controller not reachable within {:.1}s startup grace",
                self.settings.startup_grace().as_secs_f64()
            );
            return self.fail_closed(reason).await;
        }

        loop {
            self.cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval()) => {}
                _ = &mut shutdown => break,
            }
        }
        self.shutdown().await
    }

    /// Poll `/health` until it answers or the grace deadline passes.
    async fn startup_grace(&mut self) -> bool {
        let deadline = Instant::now() + self.settings.startup_grace();
        tracing::info!(
            controller = %self.client.base_url(),
            grace_secs = self.settings.startup_grace().as_secs_f64(),
            "waiting for controller"
        );
        loop {
            match self.client.health().await {
                Ok(()) => {
                    tracing::info!("controller is up");
                    return true;
                }
                Err(e) => tracing::debug!(error = %e, "controller not ready yet"),
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.grace_poll().min(deadline - now)).await;
        }
    }

    /// One evaluation: read the inhibit flag and enforce it.
    async fn cycle(&mut self) {
        match self.client.is_inhibited().await {
            Ok(false) => self.keep_running().await,
            Ok(true) => self.hold_stopped("controller reports inhibited".to_string()).await,
            Err(e) => {
                self.hold_stopped(format!("lost contact with controller: {e}"))
                    .await
            }
        }
    }

    async fn keep_running(&mut self) {
        if self.phase != WatchdogPhase::Running {
            self.transition(WatchdogPhase::Running, None);
        }

        if !self.process.is_alive() {
            match self.process.start() {
                Ok(_) => self.publish(),
                Err(e) => {
                    // Nothing is running, so there is no liveness to report.
                    tracing::error!(error = %e, "failed to start workload; skipping heartbeat");
                    return;
                }
            }
        }

        if let Err(e) = self.client.heartbeat(&self.settings.agent).await {
            // Only losing the inhibit read stops the workload.
            tracing::warn!(error = %e, "heartbeat failed");
        }
    }

    async fn hold_stopped(&mut self, reason: String) {
        if self.phase != WatchdogPhase::Inhibited {
            tracing::warn!(reason = %reason, "stopping workload");
            self.transition(WatchdogPhase::Inhibited, Some(reason));
        }
        self.stop_workload().await;
    }

    async fn stop_workload(&mut self) {
        match self.process.graceful_stop(self.settings.stop_timeout()).await {
            Ok(StopOutcome::NotRunning) => return,
            Ok(outcome) => tracing::info!(?outcome, "workload stopped"),
            Err(e) => {
                tracing::error!(error = %e, "graceful stop failed, forcing kill");
                if let Err(e) = self.process.force_kill().await {
                    // Retried on the next cycle.
                    tracing::error!(error = %e, "force kill failed");
                }
            }
        }
        self.publish();
    }

    async fn fail_closed(mut self, reason: String) -> WatchdogOutcome {
        tracing::error!(reason = %reason, "enforcing fail-closed; workload will not run");
        self.transition(WatchdogPhase::FailClosed, Some(reason.clone()));
        self.stop_workload().await;
        WatchdogOutcome::FailClosed { reason }
    }

    async fn shutdown(mut self) -> WatchdogOutcome {
        self.transition(WatchdogPhase::ShuttingDown, Some("shutdown requested".to_string()));
        self.stop_workload().await;
        if let Some(file) = &self.status_file {
            file.remove();
        }
        WatchdogOutcome::Shutdown
    }

    fn transition(&mut self, phase: WatchdogPhase, reason: Option<String>) {
        tracing::info!(from = ?self.phase, to = ?phase, reason = ?reason, "watchdog transition");
        self.phase = phase;
        self.last_reason = reason;
        self.publish();
    }

    fn publish(&mut self) {
        let data = StatusData {
            pid: std::process::id(),
            phase: self.phase,
            agent: self.settings.agent.clone(),
            workload: self.process.state(),
            workload_pid: self.process.pid(),
            workload_starts: self.process.starts(),
            last_reason: self.last_reason.clone(),
            last_update: Utc::now(),
        };
        if let Some(file) = &self.status_file {
            if let Err(e) = file.write(&data) {
                tracing::warn!(error = %e, "failed to write status file");
            }
        }
        self.updates.send_replace(data);
    }
}
