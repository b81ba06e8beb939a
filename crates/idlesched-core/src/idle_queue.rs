//! FIFO queue of idle tasks.
//!
//! Idle tasks have no ready time; they run only inside an idle period and
//! receive that period's deadline.

use std::collections::VecDeque;
use std::fmt;

use crate::clock::Ticks;

/// Callback of an idle task. The argument is the idle deadline.
pub type IdleCallback = Box<dyn FnOnce(Ticks)>;

/// A unit of idle work.
pub struct IdleTask {
    callback: IdleCallback,
    sequence: u64,
}

impl IdleTask {
    pub fn new(callback: impl FnOnce(Ticks) + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            sequence: 0,
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Runs the task with the given deadline.
    pub fn run(self, deadline: Ticks) {
        (self.callback)(deadline);
    }
}

impl fmt::Debug for IdleTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTask")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct IdleTaskQueue {
    tasks: VecDeque<IdleTask>,
    next_sequence: u64,
}

impl IdleTaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the back of the queue. Returns the task's sequence number.
    pub fn post_idle_task(&mut self, mut task: IdleTask) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        task.sequence = sequence;
        self.tasks.push_back(task);
        sequence
    }

    pub fn pop_next_idle_task(&mut self) -> Option<IdleTask> {
        self.tasks.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
