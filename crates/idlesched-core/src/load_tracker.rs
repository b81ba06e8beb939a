//! Thread load tracking.
//!
//! Splits time into fixed reporting intervals and reports, for each closed
//! interval, the fraction of it spent running tasks. A gap spanning many
//! intervals keeps only the most recent `max_samples` of them.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Ticks;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Load of one closed reporting interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    /// End of the interval.
    pub at: Ticks,
    /// Busy fraction in `[0.0, 1.0]`.
    pub load: f64,
}

#[derive(Debug)]
pub struct LoadTracker {
    interval: Duration,
    period_start: Ticks,
    accounted_until: Ticks,
    busy_in_period: Duration,
    samples: VecDeque<LoadSample>,
    max_samples: usize,
}

impl LoadTracker {
    /// A zero `interval` is raised to one millisecond.
    #[must_use]
    pub fn new(now: Ticks, interval: Duration, max_samples: usize) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            period_start: now,
            accounted_until: now,
            busy_in_period: Duration::ZERO,
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start of the interval currently being accumulated.
    #[must_use]
    pub fn period_start(&self) -> Ticks {
        self.period_start
    }

    /// Accounts a task that ran from `start` to `end`; the gap before `start`
    /// counts as idle.
    pub fn record_task_time(&mut self, start: Ticks, end: Ticks) {
        self.advance(start, false);
        self.advance(end, true);
    }

    /// Accounts idle time up to `now`.
    pub fn record_idle(&mut self, now: Ticks) {
        self.advance(now, false);
    }

    fn advance(&mut self, to: Ticks, busy: bool) {
        let cursor = self.accounted_until;
        if to <= cursor {
            return;
        }
        self.accounted_until = to;
        let period_end = self.period_start + self.interval;
        if to < period_end {
            if busy {
                self.busy_in_period += to.saturating_duration_since(cursor);
            }
            return;
        }
        if busy {
            self.busy_in_period += period_end.saturating_duration_since(cursor);
        }
        self.close_period(period_end);

        // Whole intervals left in the gap all have the same load; only the
        // last `max_samples` of them can survive in the ring.
        let interval_nanos = u64::try_from(self.interval.as_nanos()).unwrap_or(u64::MAX);
        let gap_nanos = u64::try_from(to.saturating_duration_since(self.period_start).as_nanos())
            .unwrap_or(u64::MAX);
        let whole = gap_nanos / interval_nanos;
        let kept = whole.min(self.max_samples as u64);
        self.period_start += Duration::from_nanos((whole - kept) * interval_nanos);
        let full_busy = if busy { self.interval } else { Duration::ZERO };
        for _ in 0..kept {
            self.busy_in_period = full_busy;
            let end = self.period_start + self.interval;
            self.close_period(end);
        }
        if busy {
            self.busy_in_period = to.saturating_duration_since(self.period_start);
        }
    }

    fn close_period(&mut self, period_end: Ticks) {
        let load = (self.busy_in_period.as_secs_f64() / self.interval.as_secs_f64()).clamp(0.0, 1.0);
        let sample = LoadSample {
            at: period_end,
            load,
        };
        debug!(at = %period_end, load_percent = (load * 100.0) as u32, "thread load");
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.period_start = period_end;
        self.busy_in_period = Duration::ZERO;
    }

    /// Most recent samples, oldest first.
    #[must_use]
    pub fn samples(&self) -> Vec<LoadSample> {
        self.samples.iter().copied().collect()
    }

    #[must_use]
    pub fn last_sample(&self) -> Option<LoadSample> {
        self.samples.back().copied()
    }
}
