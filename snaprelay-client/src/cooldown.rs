use std::sync::{Arc, Mutex};

use snaprelay_core::{STOP_COOLDOWN_MS, STOP_STUCK_THRESHOLD_MS};
use tokio::{task::JoinHandle, time::{Duration, Instant, sleep}};
use tracing::{debug, warn};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Blocked by an active cooldown. `advise` is set exactly once per stop
    /// so the user sees a single "please wait" notice, not one per attempt.
    Blocked { advise: bool },
}

#[derive(Debug, Default)]
struct StopState {
    is_stopped: bool,
    stopped_at: Option<Instant>,
    advisory_shown: bool,
}

/// Tracks user-initiated stop actions and gates new analysis for a cooldown
/// window. An auto-clear task lifts the flag after [`STOP_COOLDOWN_MS`]; if
/// that task never fires (runtime suspension), the flag self-heals once it
/// has been set for [`STOP_STUCK_THRESHOLD_MS`].
#[derive(Debug)]
pub struct StopCooldownGuard {
    state: Arc<Mutex<StopState>>,
    auto_clear: Option<JoinHandle<()>>,
}

impl Default for StopCooldownGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl StopCooldownGuard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StopState::default())),
            auto_clear: None,
        }
    }

    pub fn stop(&mut self) {
        if let Some(pending) = self.auto_clear.take() {
            pending.abort();
        }

        if let Ok(mut state) = self.state.lock() {
            state.is_stopped = true;
            state.stopped_at = Some(Instant::now());
            state.advisory_shown = false;
        }

        let state = Arc::clone(&self.state);
        self.auto_clear = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(STOP_COOLDOWN_MS)).await;
            if let Ok(mut state) = state.lock() {
                state.is_stopped = false;
                state.stopped_at = None;
            }
        }));
    }

    /// Admission check run before accepting any new analysis request.
    pub fn admit(&mut self) -> Admission {
        let Ok(mut state) = self.state.lock() else {
            return Admission::Admitted;
        };

        if !state.is_stopped {
            return Admission::Admitted;
        }

        let elapsed_ms = state
            .stopped_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(u64::MAX);

        if elapsed_ms >= STOP_STUCK_THRESHOLD_MS {
            // The auto-clear never fired; heal instead of blocking forever.
            warn!(elapsed_ms, "stop flag stuck past threshold, self-healing");
            state.is_stopped = false;
            state.stopped_at = None;
            drop(state);
            if let Some(pending) = self.auto_clear.take() {
                pending.abort();
            }
            return Admission::Admitted;
        }

        let advise = !state.advisory_shown;
        state.advisory_shown = true;
        debug!(elapsed_ms, advise, "analysis blocked by stop cooldown");
        Admission::Blocked { advise }
    }

    /// Clears the stop flag immediately, bypassing the cooldown.
    pub fn reset(&mut self) {
        if let Some(pending) = self.auto_clear.take() {
            pending.abort();
        }
        if let Ok(mut state) = self.state.lock() {
            *state = StopState::default();
        }
    }
}

impl Drop for StopCooldownGuard {
    fn drop(&mut self) {
        if let Some(pending) = self.auto_clear.take() {
            pending.abort();
        }
    }
}
