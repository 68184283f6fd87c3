/// Supervised workload process: start, graceful stop with escalation, force kill.
///
/// The child is spawned in its own process group (via `process_group(0)`) so
/// stop signals reach everything the workload forked. Only the watchdog owns
/// a `SupervisedProcess`; nothing else signals the workload.
use crate::config::WorkloadConfig;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    NotRunning,
    /// The process exited within the grace timeout.
    Exited(Option<i32>),
    /// The grace timeout elapsed and the process group was killed.
    Killed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn workload {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to signal workload pid {pid}: {source}")]
    Signal { pid: u32, source: nix::errno::Errno },
    #[error("failed to wait for workload: {source}")]
    Wait { source: std::io::Error },
}

#[derive(Debug)]
pub struct SupervisedProcess {
    command: String,
    args: Vec<String>,
    child: Option<Child>,
    /// Process group of the current launch; equal to the leader's pid.
    pgid: Option<u32>,
    state: ProcessState,
    starts: u32,
}

impl SupervisedProcess {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            child: None,
            pgid: None,
            state: ProcessState::NotStarted,
            starts: 0,
        }
    }

    pub fn from_config(config: &WorkloadConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Number of times the workload has been launched.
    pub fn starts(&self) -> u32 {
        self.starts
    }

    /// Launch the workload if it is not already running. Returns its pid.
    pub fn start(&mut self) -> Result<u32, ProcessError> {
        if self.is_alive() {
            if let Some(pid) = self.pid() {
                return Ok(pid);
            }
        }

        tracing::info!(command = %self.command, args = ?self.args, "launching workload");
        let child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        self.pgid = child.id();
        self.child = Some(child);
        self.state = ProcessState::Running;
        self.starts += 1;
        tracing::info!(pid, starts = self.starts, "workload started");
        Ok(pid)
    }

    /// Whether the workload is running. Reaps it if it exited on its own.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(exit_code = ?status.code(), "workload exited on its own");
                self.finish(status);
                false
            }
            Err(e) => {
                // Can't tell; report alive so a stop is still attempted.
                tracing::warn!(error = %e, "failed to poll workload status");
                true
            }
        }
    }

    /// Ask the workload to stop (SIGTERM to its group), wait up to `timeout`
    /// for the leader, then escalate to SIGKILL. Either way the group is
    /// SIGKILLed once the leader is gone, so descendants that ignore SIGTERM
    /// do not survive.
    pub async fn graceful_stop(&mut self, timeout: Duration) -> Result<StopOutcome, ProcessError> {
        if !self.is_alive() {
            return Ok(StopOutcome::NotRunning);
        }
        self.state = ProcessState::Stopping;

        let Some(pgid) = self.pgid else {
            return self.force_kill().await.map(|_| StopOutcome::Killed);
        };

        if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
            tracing::warn!(pgid, error = %e, "SIGTERM failed, forcing kill");
            return self.force_kill().await.map(|_| StopOutcome::Killed);
        }
        tracing::info!(pgid, timeout_secs = timeout.as_secs_f64(), "sent SIGTERM to workload");

        let waited = match self.child.as_mut() {
            Some(child) => tokio::time::timeout(timeout, child.wait()).await,
            None => return Ok(StopOutcome::NotRunning),
        };
        match waited {
            Ok(Ok(status)) => {
                self.finish(status);
                Ok(StopOutcome::Exited(status.code()))
            }
            Ok(Err(e)) => Err(ProcessError::Wait { source: e }),
            Err(_) => {
                tracing::warn!(pgid, "workload ignored SIGTERM, escalating to SIGKILL");
                self.force_kill().await.map(|_| StopOutcome::Killed)
            }
        }
    }

    /// SIGKILL the whole process group and reap the child.
    pub async fn force_kill(&mut self) -> Result<(), ProcessError> {
        let Some(mut child) = self.child.take() else {
            self.sweep_group();
            self.state = ProcessState::Stopped;
            return Ok(());
        };
        if let Some(pgid) = self.pgid {
            if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
                tracing::warn!(pgid, error = %e, "killpg failed, killing leader only");
                child.start_kill().map_err(|e| ProcessError::Wait { source: e })?;
            }
        } else {
            child.start_kill().map_err(|e| ProcessError::Wait { source: e })?;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| ProcessError::Wait { source: e })?;
        self.finish(status);
        tracing::info!("workload force-killed");
        Ok(())
    }

    /// The leader is reaped; SIGKILL whatever is left of its group so no
    /// descendant outlives the workload.
    fn finish(&mut self, status: ExitStatus) {
        tracing::info!(exit_code = ?status.code(), "workload stopped");
        self.child = None;
        self.sweep_group();
        self.state = ProcessState::Stopped;
    }

    fn sweep_group(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match signal_group(pgid, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pgid, "workload process group swept"),
            Err(e) => tracing::error!(pgid, error = %e, "failed to kill workload process group"),
        }
    }
}

/// Signal a process group. A group that is already gone counts as success.
fn signal_group(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        source: nix::errno::Errno::EINVAL,
    })?;
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal { pid, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> SupervisedProcess {
        SupervisedProcess::new("sleep", vec!["30".to_string()])
    }

    #[tokio::test]
    async fn test_starts_not_started() {
        let mut proc = sleeper();
        assert_eq!(proc.state(), ProcessState::NotStarted);
        assert!(!proc.is_alive());
        assert_eq!(proc.pid(), None);
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let mut proc = sleeper();
        let pid = proc.start().unwrap();
        assert!(pid > 0);
        assert_eq!(proc.state(), ProcessState::Running);
        assert!(proc.is_alive());

        let outcome = proc.graceful_stop(Duration::from_secs(3)).await.unwrap();
        // sleep dies from SIGTERM, so there is no exit code
        assert_eq!(outcome, StopOutcome::Exited(None));
        assert_eq!(proc.state(), ProcessState::Stopped);
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let mut proc = sleeper();
        let first = proc.start().unwrap();
        let second = proc.start().unwrap();
        assert_eq!(first, second);
        assert_eq!(proc.starts(), 1);
        proc.force_kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_escalates_when_sigterm_ignored() {
        let mut proc = SupervisedProcess::new(
            "sh",
            vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
        );
        proc.start().unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = proc.graceful_stop(Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
        assert_eq!(proc.state(), ProcessState::Stopped);
        assert!(!proc.is_alive());
    }

    /// Alive and not a zombie. An orphaned zombie may linger until init reaps it.
    fn running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_stop_kills_descendant_that_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("grandchild.pid");
        let script = format!(
            "(trap '' TERM; sleep 30 & echo $! > {}; wait) & sleep 30",
            pidfile.display()
        );
        let mut proc = SupervisedProcess::new("sh", vec!["-c".to_string(), script]);
        proc.start().unwrap();

        let mut grandchild = None;
        for _ in 0..50 {
            if let Some(pid) = std::fs::read_to_string(&pidfile)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
            {
                grandchild = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let grandchild = grandchild.expect("grandchild pid written");
        assert!(running(grandchild));

        // The leader dies from SIGTERM; the grandchild ignores it.
        let outcome = proc.graceful_stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Exited(None));
        assert_eq!(proc.state(), ProcessState::Stopped);

        let mut gone = false;
        for _ in 0..40 {
            if !running(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "grandchild {grandchild} survived the stop");
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let mut proc = sleeper();
        let outcome = proc.graceful_stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_detects_self_exit_and_restarts() {
        let mut proc = SupervisedProcess::new("true", vec![]);
        proc.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!proc.is_alive());
        assert_eq!(proc.state(), ProcessState::Stopped);

        proc.start().unwrap();
        assert_eq!(proc.starts(), 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut proc = SupervisedProcess::new("nonexistent-binary-xyz", vec![]);
        let err = proc.start().unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
        assert_eq!(proc.state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_force_kill_reaps_child() {
        let mut proc = sleeper();
        proc.start().unwrap();
        proc.force_kill().await.unwrap();
        assert_eq!(proc.state(), ProcessState::Stopped);
        assert_eq!(proc.pid(), None);
    }
}
