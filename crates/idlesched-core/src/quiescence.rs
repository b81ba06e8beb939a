//! Quiescence detection for long idle periods.
//!
//! A long idle period may only start once the thread has gone a full
//! quiescence delay without running an immediate task. Every immediate task
//! re-arms the delay, so a burst of work pushes idle work out until the
//! burst has been over for that long.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::Ticks;

/// Answer to a request to enter a long idle period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleGrant {
    /// The long idle period may start now.
    Granted,
    /// Ask again once `after` has elapsed.
    Retry { after: Duration },
}

impl IdleGrant {
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Decides when a long idle period may be entered.
pub trait QuiescencePolicy {
    /// Called when idle work is pending and no idle period is active.
    fn can_enter_long_idle_period(&mut self, now: Ticks) -> IdleGrant;

    /// Called after every immediate task.
    fn on_immediate_task_ran(&mut self, now: Ticks);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QuiescenceState {
    Quiescent,
    NotQuiescent { recheck_at: Ticks },
}

/// The stock [`QuiescencePolicy`]: quiescent once `delay` has passed since
/// the last immediate task.
#[derive(Debug, Clone)]
pub struct QuiescenceMonitor {
    delay: Duration,
    state: QuiescenceState,
    not_quiescent_signals: u64,
}

impl QuiescenceMonitor {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: QuiescenceState::Quiescent,
            not_quiescent_signals: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> QuiescenceState {
        self.state
    }

    /// Number of quiescent to not-quiescent transitions so far.
    #[must_use]
    pub fn not_quiescent_signals(&self) -> u64 {
        self.not_quiescent_signals
    }

    fn is_not_quiescent(&mut self, now: Ticks) {
        self.not_quiescent_signals += 1;
        debug!(at = %now, delay_ms = self.delay.as_millis() as u64, "thread is not quiescent");
    }
}

impl QuiescencePolicy for QuiescenceMonitor {
    fn can_enter_long_idle_period(&mut self, now: Ticks) -> IdleGrant {
        match self.state {
            QuiescenceState::Quiescent => IdleGrant::Granted,
            QuiescenceState::NotQuiescent { recheck_at } if now >= recheck_at => {
                self.state = QuiescenceState::Quiescent;
                trace!(at = %now, "quiescence re-established");
                IdleGrant::Granted
            }
            QuiescenceState::NotQuiescent { recheck_at } => IdleGrant::Retry {
                after: recheck_at.saturating_duration_since(now),
            },
        }
    }

    fn on_immediate_task_ran(&mut self, now: Ticks) {
        if self.state == QuiescenceState::Quiescent {
            self.is_not_quiescent(now);
        }
        self.state = QuiescenceState::NotQuiescent {
            recheck_at: now + self.delay,
        };
    }
}
