//! Idle period state machine and deadline computation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::Ticks;
use crate::quiescence::{IdleGrant, QuiescencePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePeriodState {
    NotInIdlePeriod,
    /// Host-driven period with a host-supplied deadline (e.g. a frame gap).
    InShortIdlePeriod,
    /// Scheduler-driven period bounded by the maximum idle period length.
    InLongIdlePeriod,
}

/// Why an idle period ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePeriodEndReason {
    /// The idle queue ran dry.
    Exhausted,
    /// The deadline was reached with idle work still pending.
    DeadlineReached,
    /// An immediate task became ready.
    ImmediateWork,
    /// The host ended the period explicitly.
    Host,
}

/// Result of trying to enter a long idle period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    Entered { deadline: Ticks },
    Deferred { retry_after: Duration },
}

/// Owns [`IdlePeriodState`] and the deadline handed to idle tasks.
#[derive(Debug, Clone)]
pub struct IdlePeriodController {
    max_idle_period: Duration,
    state: IdlePeriodState,
    deadline: Option<Ticks>,
    last_deadline: Ticks,
    deadline_is_max: bool,
}

impl IdlePeriodController {
    #[must_use]
    pub fn new(max_idle_period: Duration) -> Self {
        Self {
            max_idle_period,
            state: IdlePeriodState::NotInIdlePeriod,
            deadline: None,
            last_deadline: Ticks::ZERO,
            deadline_is_max: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> IdlePeriodState {
        self.state
    }

    #[must_use]
    pub fn max_idle_period(&self) -> Duration {
        self.max_idle_period
    }

    #[must_use]
    pub fn is_in_idle_period(&self) -> bool {
        self.state != IdlePeriodState::NotInIdlePeriod
    }

    /// Deadline of the active idle period, if any.
    #[must_use]
    pub fn active_deadline(&self) -> Option<Ticks> {
        self.deadline
    }

    /// Last deadline handed out. Survives the end of the period, so an idle
    /// period that simply ran out of work leaves it untouched.
    #[must_use]
    pub fn current_idle_task_deadline(&self) -> Ticks {
        self.last_deadline
    }

    /// True inside a long idle period whose deadline is the full maximum,
    /// i.e. no delayed task is waiting to run when it expires.
    #[must_use]
    pub fn can_exceed_idle_deadline_if_required(&self) -> bool {
        self.state == IdlePeriodState::InLongIdlePeriod && self.deadline_is_max
    }

    /// Computes a long idle deadline: `now + max_idle_period`, clipped down to
    /// `next_delayed` when that is sooner, never earlier than `now`. The flag
    /// reports whether clipping happened.
    #[must_use]
    pub fn long_idle_deadline(&self, now: Ticks, next_delayed: Option<Ticks>) -> (Ticks, bool) {
        let max_deadline = now + self.max_idle_period;
        match next_delayed {
            Some(ready) if ready < max_deadline => (ready.max(now), true),
            _ => (max_deadline, false),
        }
    }

    /// Asks `policy` whether a long idle period may start and enters it if so.
    pub fn try_enter_long_idle_period(
        &mut self,
        now: Ticks,
        next_delayed: Option<Ticks>,
        policy: &mut dyn QuiescencePolicy,
    ) -> EnterOutcome {
        debug_assert_eq!(self.state, IdlePeriodState::NotInIdlePeriod);
        match policy.can_enter_long_idle_period(now) {
            IdleGrant::Retry { after } => {
                trace!(at = %now, retry_after_ms = after.as_millis() as u64, "long idle period deferred");
                EnterOutcome::Deferred { retry_after: after }
            }
            IdleGrant::Granted => {
                let (deadline, clipped) = self.long_idle_deadline(now, next_delayed);
                self.begin(IdlePeriodState::InLongIdlePeriod, deadline);
                self.deadline_is_max = !clipped;
                debug!(at = %now, deadline = %deadline, clipped, "entered long idle period");
                EnterOutcome::Entered { deadline }
            }
        }
    }

    /// Starts a host-driven idle period ending at `deadline` (clamped to
    /// `now`). Replaces any active period.
    pub fn start_short_idle_period(&mut self, now: Ticks, deadline: Ticks) -> Ticks {
        let deadline = deadline.max(now);
        self.begin(IdlePeriodState::InShortIdlePeriod, deadline);
        self.deadline_is_max = false;
        debug!(at = %now, deadline = %deadline, "entered short idle period");
        deadline
    }

    fn begin(&mut self, state: IdlePeriodState, deadline: Ticks) {
        self.state = state;
        self.deadline = Some(deadline);
        self.last_deadline = deadline;
    }

    /// Ends the active idle period. Returns `false` when none was active.
    pub fn end_idle_period(&mut self, now: Ticks, reason: IdlePeriodEndReason) -> bool {
        if self.state == IdlePeriodState::NotInIdlePeriod {
            return false;
        }
        debug!(at = %now, state = ?self.state, ?reason, "idle period ended");
        self.state = IdlePeriodState::NotInIdlePeriod;
        self.deadline = None;
        self.deadline_is_max = false;
        true
    }
}
