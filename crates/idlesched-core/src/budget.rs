//! Lifecycle state and CPU-time budget throttling.
//!
//! While the scheduler is `Throttled`, immediate tasks draw on a
//! [`CpuTimeBudgetPool`]. Each task's run time is charged against the
//! budget; the budget recovers at `recovery_rate` seconds per elapsed
//! second. A negative budget holds immediate work back until it has
//! recovered to zero.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Ticks;
use crate::config::ThrottlingConfig;

/// Visibility / throttling state the host reports for the thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingLifecycleState {
    #[default]
    NotThrottled,
    /// Not visible; scheduling is unchanged but observers may react.
    Hidden,
    /// Immediate work is subject to the CPU-time budget.
    Throttled,
    /// Nothing runs until the state changes.
    Stopped,
}

/// A CPU-time budget in signed nanoseconds.
#[derive(Debug, Clone)]
pub struct CpuTimeBudgetPool {
    max_budget_level: Option<Duration>,
    recovery_rate: f64,
    max_throttling_delay: Option<Duration>,
    budget_nanos: i64,
    last_checkpoint: Ticks,
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

impl CpuTimeBudgetPool {
    /// Creates a pool with an empty (zero) budget at `now`.
    #[must_use]
    pub fn new(
        max_budget_level: Option<Duration>,
        recovery_rate: f64,
        max_throttling_delay: Option<Duration>,
        now: Ticks,
    ) -> Self {
        debug_assert!(recovery_rate > 0.0);
        Self {
            max_budget_level,
            recovery_rate,
            max_throttling_delay,
            budget_nanos: 0,
            last_checkpoint: now,
        }
    }

    #[must_use]
    pub fn from_config(config: &ThrottlingConfig, now: Ticks) -> Self {
        Self::new(
            config.max_budget_level(),
            config.recovery_rate,
            config.max_throttling_delay(),
            now,
        )
    }

    /// Current budget in nanoseconds; negative means overdrawn.
    #[must_use]
    pub fn budget_nanos(&self) -> i64 {
        self.budget_nanos
    }

    fn advance(&mut self, now: Ticks) {
        if now <= self.last_checkpoint {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_checkpoint);
        let recovered = (elapsed.as_nanos() as f64 * self.recovery_rate).round() as i64;
        self.budget_nanos = self.budget_nanos.saturating_add(recovered);
        if let Some(max) = self.max_budget_level {
            self.budget_nanos = self.budget_nanos.min(duration_nanos(max));
        }
        self.last_checkpoint = now;
    }

    fn enforce_min_budget_level(&mut self) {
        if let Some(max_delay) = self.max_throttling_delay {
            // Recovering this much takes exactly `max_delay`.
            let floor = -((max_delay.as_nanos() as f64 * self.recovery_rate) as i64);
            self.budget_nanos = self.budget_nanos.max(floor);
        }
    }

    /// Charges the run time of a task that ran from `start` to `end`.
    pub fn record_task_run_time(&mut self, start: Ticks, end: Ticks) {
        self.advance(end);
        let cost = duration_nanos(end.saturating_duration_since(start));
        self.budget_nanos = self.budget_nanos.saturating_sub(cost);
        self.enforce_min_budget_level();
    }

    pub fn can_run_tasks_at(&mut self, now: Ticks) -> bool {
        self.advance(now);
        self.budget_nanos >= 0
    }

    /// Earliest time at which the budget is back to zero.
    pub fn next_allowed_run_time(&mut self, now: Ticks) -> Ticks {
        self.advance(now);
        if self.budget_nanos >= 0 {
            return now;
        }
        let deficit = self.budget_nanos.unsigned_abs() as f64;
        let wait_nanos = (deficit / self.recovery_rate).ceil() as u64;
        now + Duration::from_nanos(wait_nanos)
    }
}
