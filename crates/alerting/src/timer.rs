//! Confirmation timer
//!
//! # State Machine
//!
//! ```text
//!            cancel(), elapsed < window
//!  Running ──────────────────────────► Cancelled
//!     │
//!     │ elapsed >= window (runner, late cancel, or expire_now())
//!     └──────────────────────────────► TimedOut
//! ```
//!
//! Both terminal states are final. Resolution is a compare-and-set on the
//! shared state, so when a cancel races the expiry check exactly one of
//! them wins and the other becomes a no-op.
//!
//! Remaining time is always recomputed from the monotonic start instant,
//! never decremented, so a suspended task catches up on its next wake.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Timer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerState {
    Running,
    Cancelled,
    TimedOut,
}

impl TimerState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TimerState::Running)
    }
}

/// How a call to [`ConfirmationTimer::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerExit {
    /// The countdown itself resolved the timer to `TimedOut`
    Expired,
    /// Someone else resolved the timer first
    Superseded(TimerState),
}

struct TimerInner {
    started_at: Instant,
    window: Duration,
    state: watch::Sender<TimerState>,
    countdown: watch::Sender<u64>,
}

/// Cancellable countdown. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConfirmationTimer {
    inner: Arc<TimerInner>,
}

impl std::fmt::Debug for ConfirmationTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationTimer")
            .field("window", &self.inner.window)
            .field("state", &self.state())
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl ConfirmationTimer {
    /// Start a timer now, in the `Running` state
    pub fn start(window: Duration) -> Self {
        let (state, _) = watch::channel(TimerState::Running);
        let (countdown, _) = watch::channel(ceil_secs(window));
        Self {
            inner: Arc::new(TimerInner {
                started_at: Instant::now(),
                window,
                state,
                countdown,
            }),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    pub fn deadline(&self) -> Instant {
        self.inner.started_at + self.inner.window
    }

    pub fn state(&self) -> TimerState {
        *self.inner.state.borrow()
    }

    /// Wall-clock time left before expiry
    pub fn remaining(&self) -> Duration {
        self.inner.window.saturating_sub(self.inner.started_at.elapsed())
    }

    /// Display value: whole seconds left, rounded up
    pub fn countdown_secs(&self) -> u64 {
        ceil_secs(self.remaining())
    }

    /// Cancel signal. Returns true if this call resolved the timer to
    /// `Cancelled`; a cancel at or past the deadline never wins.
    pub fn cancel(&self) -> bool {
        self.cancel_or_expire() == Some(TimerState::Cancelled)
    }

    /// Cancel signal that reports what it did.
    ///
    /// Elapsed time decides, not whether the countdown task has woken yet: at
    /// or past the deadline the timer resolves to `TimedOut` instead. Returns
    /// the state written by this call, or `None` if already resolved.
    pub fn cancel_or_expire(&self) -> Option<TimerState> {
        self.resolve(TimerState::Cancelled)
    }

    /// Expiry observed elsewhere (e.g. the device's own window ran out).
    /// Returns true if this call resolved the timer.
    pub fn expire_now(&self) -> bool {
        self.resolve(TimerState::TimedOut).is_some()
    }

    fn resolve(&self, to: TimerState) -> Option<TimerState> {
        let inner = &*self.inner;
        let mut written = None;
        inner.state.send_if_modified(|state| {
            if *state != TimerState::Running {
                return false;
            }
            let next = if to == TimerState::Cancelled && inner.started_at.elapsed() >= inner.window {
                TimerState::TimedOut
            } else {
                to
            };
            *state = next;
            written = Some(next);
            true
        });

        if let Some(state) = written {
            debug!("Confirmation timer resolved: {:?}", state);
            if state == TimerState::TimedOut {
                inner.countdown.send_replace(0);
            }
        }
        written
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<TimerState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to the display countdown
    pub fn watch_countdown(&self) -> watch::Receiver<u64> {
        self.inner.countdown.subscribe()
    }

    /// Wait until the timer reaches a terminal state
    pub async fn resolved(&self) -> TimerState {
        let mut rx = self.inner.state.subscribe();
        let resolved = match rx.wait_for(TimerState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        resolved
    }

    /// Drive the countdown until the timer resolves.
    ///
    /// Wakes on every display tick, at the deadline, and on any state change.
    pub async fn run(&self, tick: Duration) -> TimerExit {
        let mut state_rx = self.inner.state.subscribe();
        let mut ticker = time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = self.deadline();

        loop {
            let current = *state_rx.borrow_and_update();
            if current.is_terminal() {
                return TimerExit::Superseded(current);
            }

            if self.remaining().is_zero() {
                return if self.resolve(TimerState::TimedOut).is_some() {
                    TimerExit::Expired
                } else {
                    TimerExit::Superseded(self.state())
                };
            }

            self.inner.countdown.send_replace(self.countdown_secs());

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return TimerExit::Superseded(self.state());
                    }
                }
                _ = ticker.tick() => {}
                _ = time::sleep_until(deadline) => {}
            }
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
