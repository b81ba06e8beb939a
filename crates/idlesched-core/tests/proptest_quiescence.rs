//! Property-based tests for the idle-period gate and the accounting around
//! it.
//!
//! Verifies:
//! - A long idle period is granted exactly once the quiescence delay has
//!   passed since the last immediate task
//! - A refused request reports the remaining wait
//! - Long idle deadlines lie in [now, now + max] and clip to delayed work
//! - The CPU budget never exceeds its cap nor drops below its floor
//! - Throttled work is allowed again at the reported time
//! - Load samples stay within [0, 1] and cover whole intervals

use proptest::prelude::*;
use std::time::Duration;

use idlesched_core::budget::CpuTimeBudgetPool;
use idlesched_core::clock::Ticks;
use idlesched_core::idle_period::{EnterOutcome, IdlePeriodController, IdlePeriodState};
use idlesched_core::load_tracker::LoadTracker;
use idlesched_core::quiescence::{IdleGrant, QuiescenceMonitor, QuiescencePolicy};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

/// Increasing task completion times in milliseconds.
fn arb_task_times() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..200, 0..20).prop_map(|gaps| {
        gaps.iter()
            .scan(0u64, |at, gap| {
                *at += gap;
                Some(*at)
            })
            .collect()
    })
}

// ────────────────────────────────────────────────────────────────────
// Quiescence
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn grant_follows_last_immediate_task(
        delay_ms in 0u64..600,
        times in arb_task_times(),
        probe_after in 0u64..1_000,
    ) {
        let delay = Duration::from_millis(delay_ms);
        let mut monitor = QuiescenceMonitor::new(delay);
        for at in &times {
            monitor.on_immediate_task_ran(Ticks::from_millis(*at));
        }
        let last = times.last().copied().unwrap_or(0);
        let probe = Ticks::from_millis(last + probe_after);
        let grant = monitor.can_enter_long_idle_period(probe);

        if times.is_empty() || probe_after >= delay_ms {
            prop_assert_eq!(grant, IdleGrant::Granted);
        } else {
            prop_assert_eq!(
                grant,
                IdleGrant::Retry { after: Duration::from_millis(delay_ms - probe_after) }
            );
        }
    }

    #[test]
    fn one_signal_per_busy_stretch(
        delay_ms in 1u64..600,
        bursts in prop::collection::vec(arb_task_times(), 1..6),
    ) {
        let mut monitor = QuiescenceMonitor::new(Duration::from_millis(delay_ms));
        let mut base = 0u64;
        let mut busy_stretches = 0u64;
        for burst in &bursts {
            for at in burst {
                monitor.on_immediate_task_ran(Ticks::from_millis(base + at));
            }
            if !burst.is_empty() {
                busy_stretches += 1;
                base += burst.last().copied().unwrap_or(0) + delay_ms;
                // Asking after the delay re-establishes quiescence.
                prop_assert!(monitor.can_enter_long_idle_period(Ticks::from_millis(base)).is_granted());
            }
        }
        prop_assert_eq!(monitor.not_quiescent_signals(), busy_stretches);
    }
}

// ────────────────────────────────────────────────────────────────────
// Idle period deadlines
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn long_idle_deadline_bounded_and_clipped(
        max_ms in 1u64..200,
        now_ms in 0u64..10_000,
        next_delayed in prop::option::of(0u64..10_300),
    ) {
        let max = Duration::from_millis(max_ms);
        let mut controller = IdlePeriodController::new(max);
        let now = Ticks::from_millis(now_ms);
        let next = next_delayed.map(Ticks::from_millis);
        let mut monitor = QuiescenceMonitor::new(Duration::from_millis(300));

        let outcome = controller.try_enter_long_idle_period(now, next, &mut monitor);
        let EnterOutcome::Entered { deadline } = outcome else {
            return Err(TestCaseError::fail("fresh monitor must grant"));
        };
        prop_assert!(deadline >= now);
        prop_assert!(deadline <= now + max);
        let clipped = next.is_some_and(|ready| ready < now + max);
        if let Some(ready) = next.filter(|_| clipped) {
            prop_assert_eq!(deadline, ready.max(now));
        } else {
            prop_assert_eq!(deadline, now + max);
        }
        prop_assert_eq!(controller.can_exceed_idle_deadline_if_required(), !clipped);
        prop_assert_eq!(controller.current_idle_task_deadline(), deadline);
    }

    #[test]
    fn short_idle_period_never_ends_before_now(
        now_ms in 0u64..1_000,
        deadline_ms in 0u64..2_000,
    ) {
        let mut controller = IdlePeriodController::new(Duration::from_millis(50));
        let now = Ticks::from_millis(now_ms);
        let deadline = controller.start_short_idle_period(now, Ticks::from_millis(deadline_ms));
        prop_assert_eq!(deadline, Ticks::from_millis(deadline_ms.max(now_ms)));
        prop_assert_eq!(controller.state(), IdlePeriodState::InShortIdlePeriod);
        prop_assert!(!controller.can_exceed_idle_deadline_if_required());
    }
}

// ────────────────────────────────────────────────────────────────────
// CPU budget
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn budget_stays_within_cap_and_floor(
        recovery_pct in 1u32..=100,
        max_budget_ms in 1u64..1_000,
        max_delay_ms in 1u64..5_000,
        runs in prop::collection::vec((0u64..500, 0u64..500), 0..30),
    ) {
        let rate = f64::from(recovery_pct) / 100.0;
        let mut pool = CpuTimeBudgetPool::new(
            Some(Duration::from_millis(max_budget_ms)),
            rate,
            Some(Duration::from_millis(max_delay_ms)),
            Ticks::ZERO,
        );
        let cap = i64::try_from(Duration::from_millis(max_budget_ms).as_nanos()).unwrap();
        let floor = -((Duration::from_millis(max_delay_ms).as_nanos() as f64 * rate) as i64);

        let mut at = 0u64;
        for (gap, cost) in &runs {
            let start = Ticks::from_millis(at + gap);
            let end = Ticks::from_millis(at + gap + cost);
            pool.record_task_run_time(start, end);
            prop_assert!(pool.budget_nanos() <= cap);
            prop_assert!(pool.budget_nanos() >= floor);
            at += gap + cost;
        }
    }

    #[test]
    fn throttled_work_allowed_at_reported_time(
        recovery_pct in 1u32..=100,
        cost_ms in 0u64..1_000,
    ) {
        let rate = f64::from(recovery_pct) / 100.0;
        let mut pool = CpuTimeBudgetPool::new(None, rate, None, Ticks::ZERO);
        pool.record_task_run_time(Ticks::ZERO, Ticks::from_millis(cost_ms));
        let end = Ticks::from_millis(cost_ms);
        let allowed = pool.next_allowed_run_time(end);
        prop_assert!(allowed >= end);
        prop_assert!(pool.can_run_tasks_at(allowed));
    }
}

// ────────────────────────────────────────────────────────────────────
// Load tracking
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn load_samples_bounded_and_aligned(
        interval_ms in 1u64..200,
        runs in prop::collection::vec((0u64..300, 0u64..300), 0..30),
    ) {
        let interval = Duration::from_millis(interval_ms);
        let mut tracker = LoadTracker::new(Ticks::ZERO, interval, 20_000);
        let mut at = 0u64;
        for (gap, busy) in &runs {
            tracker.record_task_time(
                Ticks::from_millis(at + gap),
                Ticks::from_millis(at + gap + busy),
            );
            at += gap + busy;
        }
        tracker.record_idle(Ticks::from_millis(at));

        let samples = tracker.samples();
        prop_assert_eq!(samples.len() as u64, at / interval_ms);
        for (index, sample) in samples.iter().enumerate() {
            prop_assert!((0.0..=1.0).contains(&sample.load));
            prop_assert_eq!(sample.at, Ticks::from_millis((index as u64 + 1) * interval_ms));
        }
    }
}
