//! Property-based tests for the immediate and idle task queues.
//!
//! Verifies:
//! - Delayed tasks pop in (ready time, post order) order
//! - A delayed task is never popped before its ready time
//! - Immediate posts keep their relative order
//! - Cancelled tasks are never popped and are counted as dropped
//! - `has_pending_delayed_task_before` agrees with the live task set
//! - Idle tasks pop in FIFO order

use proptest::prelude::*;
use std::time::Duration;

use idlesched_core::clock::Ticks;
use idlesched_core::idle_queue::{IdleTask, IdleTaskQueue};
use idlesched_core::task_queue::{Task, TaskHandle, TaskQueue};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

/// Delay in milliseconds, or `None` for an immediate post.
fn arb_delay() -> impl Strategy<Value = Option<u64>> {
    prop_oneof![
        1 => Just(None),
        3 => (0u64..500).prop_map(Some),
    ]
}

fn post_all(queue: &mut TaskQueue, now: Ticks, delays: &[Option<u64>]) -> Vec<u64> {
    delays
        .iter()
        .map(|delay| match delay {
            None => queue.post_task(Task::new(|| {})),
            Some(ms) => queue.post_delayed_task(Task::new(|| {}), Duration::from_millis(*ms), now),
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────
// Ordering
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn delayed_tasks_pop_by_ready_time_then_sequence(
        delays in prop::collection::vec(1u64..500, 0..50),
    ) {
        let mut queue = TaskQueue::new();
        let now = Ticks::from_millis(10);
        let posted: Vec<(Ticks, u64)> = delays
            .iter()
            .map(|ms| {
                let seq = queue.post_delayed_task(Task::new(|| {}), Duration::from_millis(*ms), now);
                (now + Duration::from_millis(*ms), seq)
            })
            .collect();

        let mut expected = posted.clone();
        expected.sort_unstable();

        let end = Ticks::from_millis(1_000);
        let mut popped = Vec::new();
        while let Some(task) = queue.pop_next_ready_task(end) {
            popped.push((task.ready_time().unwrap(), task.sequence()));
        }
        prop_assert_eq!(popped, expected);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn nothing_pops_before_ready_time(
        delays in prop::collection::vec(arb_delay(), 0..50),
        probe_ms in 0u64..600,
    ) {
        let mut queue = TaskQueue::new();
        let now = Ticks::ZERO;
        post_all(&mut queue, now, &delays);
        let probe = Ticks::from_millis(probe_ms);
        let mut popped = 0usize;
        while let Some(task) = queue.pop_next_ready_task(probe) {
            if let Some(ready) = task.ready_time() {
                prop_assert!(ready <= probe);
            }
            popped += 1;
        }
        let due = delays
            .iter()
            .filter(|delay| delay.is_none_or(|ms| ms <= probe_ms))
            .count();
        prop_assert_eq!(popped, due);
        prop_assert_eq!(queue.len(), delays.len() - due);
    }

    #[test]
    fn immediate_tasks_pop_in_post_order(
        delays in prop::collection::vec(arb_delay(), 0..50),
    ) {
        let mut queue = TaskQueue::new();
        let sequences = post_all(&mut queue, Ticks::ZERO, &delays);
        let immediate: Vec<u64> = delays
            .iter()
            .zip(&sequences)
            .filter(|(delay, _)| delay.is_none_or(|ms| ms == 0))
            .map(|(_, seq)| *seq)
            .collect();

        // A zero delay posts straight onto the ready list.
        let mut popped = Vec::new();
        while let Some(task) = queue.pop_next_ready_task(Ticks::ZERO) {
            if task.ready_time().is_none() {
                popped.push(task.sequence());
            }
        }
        prop_assert_eq!(popped, immediate);
    }
}

// ────────────────────────────────────────────────────────────────────
// Cancellation
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn cancelled_tasks_never_pop(
        posts in prop::collection::vec((arb_delay(), any::<bool>()), 0..50),
    ) {
        let mut queue = TaskQueue::new();
        let mut handles: Vec<(u64, TaskHandle, bool)> = Vec::new();
        for (delay, cancel) in &posts {
            let (task, handle) = Task::cancelable(|| {});
            let seq = match delay {
                None => queue.post_task(task),
                Some(ms) => queue.post_delayed_task(task, Duration::from_millis(*ms), Ticks::ZERO),
            };
            handles.push((seq, handle, *cancel));
        }
        for (_, handle, cancel) in &handles {
            if *cancel {
                handle.cancel();
            }
        }

        let mut popped = Vec::new();
        while let Some(task) = queue.pop_next_ready_task(Ticks::from_millis(1_000)) {
            prop_assert!(!task.is_cancelled());
            popped.push(task.sequence());
        }
        popped.sort_unstable();

        let live: Vec<u64> = handles
            .iter()
            .filter(|(_, _, cancel)| !cancel)
            .map(|(seq, _, _)| *seq)
            .collect();
        let cancelled = (handles.len() - live.len()) as u64;
        prop_assert_eq!(popped, live);
        prop_assert_eq!(queue.cancelled_dropped(), cancelled);
    }

    #[test]
    fn sweep_leaves_only_live_tasks(
        posts in prop::collection::vec((arb_delay(), any::<bool>()), 0..50),
    ) {
        let mut queue = TaskQueue::new();
        let mut cancelled = 0usize;
        for (delay, cancel) in &posts {
            let (task, handle) = Task::cancelable(|| {});
            match delay {
                None => queue.post_task(task),
                Some(ms) => queue.post_delayed_task(task, Duration::from_millis(*ms), Ticks::ZERO),
            };
            if *cancel {
                handle.cancel();
                cancelled += 1;
            }
        }
        prop_assert_eq!(queue.sweep_cancelled(), cancelled);
        prop_assert_eq!(queue.len(), posts.len() - cancelled);
        prop_assert_eq!(queue.sweep_cancelled(), 0);
    }

    #[test]
    fn pending_delayed_before_matches_live_tasks(
        posts in prop::collection::vec((1u64..500, any::<bool>()), 0..40),
        deadline_ms in 0u64..600,
    ) {
        let mut queue = TaskQueue::new();
        for (ms, cancel) in &posts {
            let (task, handle) = Task::cancelable(|| {});
            queue.post_delayed_task(task, Duration::from_millis(*ms), Ticks::ZERO);
            if *cancel {
                handle.cancel();
            }
        }
        let expected = posts
            .iter()
            .any(|(ms, cancel)| !cancel && *ms < deadline_ms);
        prop_assert_eq!(
            queue.has_pending_delayed_task_before(Ticks::from_millis(deadline_ms)),
            expected
        );
        let earliest = posts
            .iter()
            .filter(|(_, cancel)| !cancel)
            .map(|(ms, _)| Ticks::from_millis(*ms))
            .min();
        prop_assert_eq!(queue.next_ready_time(), earliest);
    }
}

// ────────────────────────────────────────────────────────────────────
// Idle queue
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn idle_tasks_pop_fifo(count in 0usize..60) {
        let mut queue = IdleTaskQueue::new();
        let posted: Vec<u64> = (0..count)
            .map(|_| queue.post_idle_task(IdleTask::new(|_| {})))
            .collect();
        let mut popped = Vec::new();
        while let Some(task) = queue.pop_next_idle_task() {
            popped.push(task.sequence());
        }
        prop_assert_eq!(popped, posted);
        prop_assert_eq!(queue.len(), 0);
    }
}
