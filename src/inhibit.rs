/// The authoritative inhibit flag.
///
/// One `InhibitCell` lives inside the controller. Every write bumps a
/// generation counter; an armed auto-clear timer remembers the generation it
/// was scheduled for and only clears the flag if that generation is still
/// current, so a newer explicit call always wins over an older timer.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// A complete, consistent view of the inhibit flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InhibitState {
    pub active: bool,
    pub set_at: DateTime<Utc>,
    pub auto_clear_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl InhibitState {
    fn cleared() -> Self {
        Self {
            active: false,
            set_at: Utc::now(),
            auto_clear_at: None,
            reason: None,
        }
    }
}

struct Slot {
    state: InhibitState,
    generation: u64,
    deadline: Option<Instant>,
    timer: Option<AbortHandle>,
}

impl Slot {
    /// Apply an elapsed deadline in place. Returns true if the flag was cleared.
    fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline && self.state.active => {
                self.generation += 1;
                self.state = InhibitState::cleared();
                self.deadline = None;
                self.timer = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct InhibitCell {
    slot: Arc<Mutex<Slot>>,
    auto_clear: Option<Duration>,
}

impl InhibitCell {
    /// Create the cell in the not-inhibited state. `auto_clear` arms a
    /// revert timer on every `set(true, ..)` when present.
    pub fn new(auto_clear: Option<Duration>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                state: InhibitState::cleared(),
                generation: 0,
                deadline: None,
                timer: None,
            })),
            auto_clear,
        }
    }

    pub fn auto_clear(&self) -> Option<Duration> {
        self.auto_clear
    }

    /// Current state, with any elapsed auto-clear deadline already applied.
    pub fn snapshot(&self) -> InhibitState {
        let mut slot = self.slot.lock();
        if slot.expire(Instant::now()) {
            tracing::info!("inhibit auto-cleared at deadline");
        }
        slot.state.clone()
    }

    pub fn is_active(&self) -> bool {
        self.snapshot().active
    }

    /// Replace the state atomically. Cancels any pending auto-clear timer and,
    /// when inhibiting with auto-clear configured, arms a new one.
    ///
    /// Arming a timer spawns a tokio task, so this must run inside a runtime
    /// whenever auto-clear is configured.
    pub fn set(&self, active: bool, reason: Option<String>) -> InhibitState {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        let generation = slot.generation;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }

        let set_at = Utc::now();
        let delay = self.auto_clear.filter(|_| active);
        let auto_clear_at = delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| set_at + d);

        slot.state = InhibitState {
            active,
            set_at,
            auto_clear_at,
            reason,
        };
        slot.deadline = delay.map(|d| Instant::now() + d);

        if let Some(deadline) = slot.deadline {
            let cell = self.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                cell.clear_if_current(generation);
            });
            slot.timer = Some(task.abort_handle());
        }

        tracing::info!(
            active,
            generation,
            reason = ?slot.state.reason,
            auto_clear_at = ?slot.state.auto_clear_at,
            "inhibit state replaced"
        );
        slot.state.clone()
    }

    /// Timer callback: clear the flag only if `generation` is still the most
    /// recent write. Returns true if the flag was cleared.
    fn clear_if_current(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            tracing::debug!(
                scheduled = generation,
                current = slot.generation,
                "stale auto-clear timer discarded"
            );
            return false;
        }
        let cleared = slot.expire(Instant::now());
        if cleared {
            tracing::info!(generation, "inhibit auto-cleared");
        }
        cleared
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.slot.lock().generation
    }
}
