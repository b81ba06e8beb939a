//! Immediate task queue with delayed-task support.
//!
//! Ready tasks sit in a FIFO list. Delayed tasks wait in a min-heap keyed
//! by `(ready_time, sequence)` and are promoted to the back of the ready
//! list once their ready time has passed, so tasks that become ready at the
//! same instant keep their post order.

use std::cell::Cell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Ticks;

/// Callback of an immediate task.
pub type TaskCallback = Box<dyn FnOnce()>;

/// Cancellation handle for a posted task.
///
/// Cancelling only prevents a task that has not started yet from running;
/// the queue drops the entry the next time it looks at it.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// A unit of immediate work.
pub struct Task {
    callback: TaskCallback,
    ready_time: Option<Ticks>,
    sequence: u64,
    handle: Option<TaskHandle>,
}

impl Task {
    /// Wraps a closure as a task. The sequence number is assigned on post.
    pub fn new(callback: impl FnOnce() + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            ready_time: None,
            sequence: 0,
            handle: None,
        }
    }

    /// Wraps a closure as a task that can be cancelled through the returned
    /// handle.
    pub fn cancelable(callback: impl FnOnce() + 'static) -> (Self, TaskHandle) {
        let handle = TaskHandle::default();
        let mut task = Self::new(callback);
        task.handle = Some(handle.clone());
        (task, handle)
    }

    /// Time at which a delayed task becomes eligible, `None` for tasks
    /// posted without a delay.
    #[must_use]
    pub fn ready_time(&self) -> Option<Ticks> {
        self.ready_time
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.as_ref().is_some_and(TaskHandle::is_cancelled)
    }

    pub(crate) fn into_callback(self) -> TaskCallback {
        self.callback
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("ready_time", &self.ready_time)
            .field("sequence", &self.sequence)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct DelayedTask {
    ready_time: Ticks,
    task: Task,
}

impl DelayedTask {
    fn key(&self) -> (Ticks, u64) {
        (self.ready_time, self.task.sequence)
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// FIFO queue of immediate tasks plus a heap of delayed ones.
#[derive(Debug, Default)]
pub struct TaskQueue {
    ready: VecDeque<Task>,
    delayed: BinaryHeap<Reverse<DelayedTask>>,
    next_sequence: u64,
    cancelled_dropped: u64,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn assign_sequence(&mut self, task: &mut Task) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        task.sequence = sequence;
        sequence
    }

    /// Appends a task to the back of the ready list. Returns its sequence
    /// number.
    pub fn post_task(&mut self, mut task: Task) -> u64 {
        let sequence = self.assign_sequence(&mut task);
        task.ready_time = None;
        self.ready.push_back(task);
        sequence
    }

    /// Schedules a task to become ready at `now + delay`. A zero delay is
    /// equivalent to [`post_task`](Self::post_task).
    pub fn post_delayed_task(&mut self, mut task: Task, delay: Duration, now: Ticks) -> u64 {
        if delay.is_zero() {
            return self.post_task(task);
        }
        let sequence = self.assign_sequence(&mut task);
        let ready_time = now + delay;
        task.ready_time = Some(ready_time);
        self.delayed.push(Reverse(DelayedTask { ready_time, task }));
        sequence
    }

    /// Moves every delayed task whose ready time has passed onto the ready
    /// list, in `(ready_time, sequence)` order.
    fn promote_due(&mut self, now: Ticks) {
        while let Some(Reverse(next)) = self.delayed.peek() {
            if next.ready_time > now {
                break;
            }
            let Some(Reverse(entry)) = self.delayed.pop() else {
                break;
            };
            if entry.task.is_cancelled() {
                self.cancelled_dropped += 1;
                continue;
            }
            self.ready.push_back(entry.task);
        }
    }

    fn drop_cancelled_front(&mut self) {
        while self.ready.front().is_some_and(Task::is_cancelled) {
            self.ready.pop_front();
            self.cancelled_dropped += 1;
        }
    }

    /// Removes and returns the earliest-posted task that is ready at `now`.
    pub fn pop_next_ready_task(&mut self, now: Ticks) -> Option<Task> {
        self.promote_due(now);
        self.drop_cancelled_front();
        let task = self.ready.pop_front()?;
        debug_assert!(task.ready_time.is_none_or(|ready| ready <= now));
        Some(task)
    }

    /// Whether a task would be returned by `pop_next_ready_task(now)`.
    pub fn has_ready_task(&mut self, now: Ticks) -> bool {
        self.promote_due(now);
        self.drop_cancelled_front();
        !self.ready.is_empty()
    }

    /// Ready time of the earliest live delayed task.
    pub fn next_ready_time(&mut self) -> Option<Ticks> {
        while let Some(Reverse(next)) = self.delayed.peek() {
            if !next.task.is_cancelled() {
                return Some(next.ready_time);
            }
            self.delayed.pop();
            self.cancelled_dropped += 1;
        }
        None
    }

    /// Whether a live delayed task becomes ready strictly before `deadline`.
    pub fn has_pending_delayed_task_before(&mut self, deadline: Ticks) -> bool {
        self.next_ready_time().is_some_and(|ready| ready < deadline)
    }

    /// Drops every cancelled task still queued. Returns how many were removed.
    pub fn sweep_cancelled(&mut self) -> usize {
        let before = self.len();
        self.ready.retain(|task| !task.is_cancelled());
        self.delayed.retain(|Reverse(entry)| !entry.task.is_cancelled());
        let removed = before - self.len();
        self.cancelled_dropped += removed as u64;
        removed
    }

    /// Total queued tasks, ready and delayed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    #[must_use]
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Cancelled tasks discarded so far.
    #[must_use]
    pub fn cancelled_dropped(&self) -> u64 {
        self.cancelled_dropped
    }
}
