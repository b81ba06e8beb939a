//! The scheduler core.
//!
//! [`Scheduler::step`] performs one unit of work: a ready immediate task if
//! there is one, otherwise one idle task inside an idle period. When there
//! is nothing to do it returns a [`WakeRequest`] telling the host when to
//! call again, instead of arming timers itself.
//!
//! Tasks are posted through [`TaskRunner`] and [`IdleTaskRunner`] handles
//! that share the scheduler's queues. Running tasks may post more work
//! through these handles; the queues are never borrowed while a task runs.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::budget::{CpuTimeBudgetPool, SchedulingLifecycleState};
use crate::clock::{Clock, Ticks};
use crate::config::Config;
use crate::idle_period::{
    EnterOutcome, IdlePeriodController, IdlePeriodEndReason, IdlePeriodState,
};
use crate::idle_queue::{IdleTask, IdleTaskQueue};
use crate::load_tracker::{LoadSample, LoadTracker};
use crate::quiescence::{QuiescenceMonitor, QuiescencePolicy};
use crate::task_queue::{Task, TaskHandle, TaskQueue};

/// When the host should call [`Scheduler::step`] again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "wake", content = "at", rename_all = "snake_case")]
pub enum WakeRequest {
    /// Only a newly posted task can create work.
    None,
    /// Work becomes possible at this time.
    At(Ticks),
}

impl From<Option<Ticks>> for WakeRequest {
    fn from(at: Option<Ticks>) -> Self {
        at.map_or(Self::None, Self::At)
    }
}

/// Result of one [`Scheduler::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    RanImmediate,
    RanIdle,
    Wait(WakeRequest),
}

impl StepOutcome {
    #[must_use]
    pub fn did_work(self) -> bool {
        !matches!(self, Self::Wait(_))
    }
}

/// Observes the start and end of every task, immediate or idle.
pub trait TaskTimeObserver {
    fn will_process_task(&mut self, start: Ticks);
    fn did_process_task(&mut self, start: Ticks, end: Ticks);
}

/// Told about every lifecycle state change.
pub trait LifecycleObserver {
    fn on_lifecycle_state_changed(&mut self, state: SchedulingLifecycleState);
}

impl<F: FnMut(SchedulingLifecycleState)> LifecycleObserver for F {
    fn on_lifecycle_state_changed(&mut self, state: SchedulingLifecycleState) {
        self(state);
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub immediate_tasks_run: u64,
    pub idle_tasks_run: u64,
    pub task_panics: u64,
    pub long_idle_periods: u64,
    pub short_idle_periods: u64,
    /// Long idle periods whose deadline was clipped by a delayed task.
    pub clipped_idle_periods: u64,
    /// Requests to enter a long idle period refused by the quiescence policy.
    pub idle_period_deferrals: u64,
    /// Steps where ready immediate work was held back by the CPU budget.
    pub throttled_steps: u64,
    pub cancelled_tasks_dropped: u64,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub at: Ticks,
    pub idle_period_state: IdlePeriodState,
    pub idle_deadline: Option<Ticks>,
    pub current_idle_task_deadline: Ticks,
    pub ready_tasks: usize,
    pub delayed_tasks: usize,
    pub idle_tasks: usize,
    pub next_delayed_task: Option<Ticks>,
    pub lifecycle_state: SchedulingLifecycleState,
    pub metrics: SchedulerMetrics,
    pub load_samples: Vec<LoadSample>,
}

/// Returned by [`Scheduler::shutdown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Time from construction to shutdown on the scheduler's clock.
    pub runtime: Duration,
    /// Live immediate tasks discarded unrun.
    pub dropped_tasks: usize,
    pub dropped_idle_tasks: usize,
    pub metrics: SchedulerMetrics,
}

#[derive(Debug, Default)]
struct Inbox {
    tasks: TaskQueue,
    idle_tasks: IdleTaskQueue,
    closed: bool,
}

/// Posts immediate and delayed tasks to a [`Scheduler`].
///
/// Posting after the scheduler has shut down drops the task and returns
/// `false`.
#[derive(Clone)]
pub struct TaskRunner {
    inbox: Rc<RefCell<Inbox>>,
    clock: Rc<dyn Clock>,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner").finish_non_exhaustive()
    }
}

impl TaskRunner {
    pub fn post_task(&self, callback: impl FnOnce() + 'static) -> bool {
        let mut inbox = self.inbox.borrow_mut();
        if inbox.closed {
            trace!("task posted after shutdown dropped");
            return false;
        }
        inbox.tasks.post_task(Task::new(callback));
        true
    }

    pub fn post_delayed_task(&self, callback: impl FnOnce() + 'static, delay: Duration) -> bool {
        self.post(Task::new(callback), delay)
    }

    /// Posts a delayed task that can be cancelled before it runs. A task
    /// posted after shutdown comes back with an already-cancelled handle.
    pub fn post_cancelable_delayed_task(
        &self,
        callback: impl FnOnce() + 'static,
        delay: Duration,
    ) -> TaskHandle {
        let (task, handle) = Task::cancelable(callback);
        if !self.post(task, delay) {
            handle.cancel();
        }
        handle
    }

    fn post(&self, task: Task, delay: Duration) -> bool {
        let now = self.clock.now();
        let mut inbox = self.inbox.borrow_mut();
        if inbox.closed {
            trace!("delayed task posted after shutdown dropped");
            return false;
        }
        inbox.tasks.post_delayed_task(task, delay, now);
        true
    }
}

/// Posts idle tasks to a [`Scheduler`].
#[derive(Clone)]
pub struct IdleTaskRunner {
    inbox: Rc<RefCell<Inbox>>,
}

impl fmt::Debug for IdleTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTaskRunner").finish_non_exhaustive()
    }
}

impl IdleTaskRunner {
    /// Posts a task that runs during an idle period and receives its deadline.
    pub fn post_idle_task(&self, callback: impl FnOnce(Ticks) + 'static) -> bool {
        let mut inbox = self.inbox.borrow_mut();
        if inbox.closed {
            trace!("idle task posted after shutdown dropped");
            return false;
        }
        inbox.idle_tasks.post_idle_task(IdleTask::new(callback));
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskKind {
    Immediate,
    Idle,
}

impl TaskKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Idle => "idle",
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

fn earliest(a: Option<Ticks>, b: Option<Ticks>) -> Option<Ticks> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Single-threaded cooperative scheduler of immediate, delayed and idle
/// tasks.
pub struct Scheduler {
    clock: Rc<dyn Clock>,
    inbox: Rc<RefCell<Inbox>>,
    idle_period: IdlePeriodController,
    policy: Box<dyn QuiescencePolicy>,
    load_tracker: Option<LoadTracker>,
    task_time_observers: Vec<Box<dyn TaskTimeObserver>>,
    lifecycle_observers: Vec<Box<dyn LifecycleObserver>>,
    lifecycle_state: SchedulingLifecycleState,
    throttling_enabled: bool,
    budget: CpuTimeBudgetPool,
    metrics: SchedulerMetrics,
    started_at: Ticks,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("idle_period", &self.idle_period)
            .field("lifecycle_state", &self.lifecycle_state)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler using the stock [`QuiescenceMonitor`].
    pub fn new(config: &Config, clock: impl Clock + 'static) -> Self {
        let policy = QuiescenceMonitor::new(config.scheduler.quiescence_delay());
        Self::with_policy(config, clock, policy)
    }

    pub fn with_policy(
        config: &Config,
        clock: impl Clock + 'static,
        policy: impl QuiescencePolicy + 'static,
    ) -> Self {
        let clock: Rc<dyn Clock> = Rc::new(clock);
        let now = clock.now();
        let load_tracker = config.load_tracking.enabled.then(|| {
            LoadTracker::new(
                now,
                config.load_tracking.reporting_interval(),
                config.load_tracking.max_samples,
            )
        });
        debug!(
            at = %now,
            quiescence_delay_ms = config.scheduler.quiescence_delay_ms,
            max_idle_period_ms = config.scheduler.max_idle_period_ms,
            throttling = config.throttling.enabled,
            "scheduler created"
        );
        Self {
            inbox: Rc::new(RefCell::new(Inbox::default())),
            idle_period: IdlePeriodController::new(config.scheduler.max_idle_period()),
            policy: Box::new(policy),
            load_tracker,
            task_time_observers: Vec::new(),
            lifecycle_observers: Vec::new(),
            lifecycle_state: SchedulingLifecycleState::NotThrottled,
            throttling_enabled: config.throttling.enabled,
            budget: CpuTimeBudgetPool::from_config(&config.throttling, now),
            metrics: SchedulerMetrics::default(),
            started_at: now,
            clock,
        }
    }

    #[must_use]
    pub fn task_runner(&self) -> TaskRunner {
        TaskRunner {
            inbox: Rc::clone(&self.inbox),
            clock: Rc::clone(&self.clock),
        }
    }

    #[must_use]
    pub fn idle_task_runner(&self) -> IdleTaskRunner {
        IdleTaskRunner {
            inbox: Rc::clone(&self.inbox),
        }
    }

    #[must_use]
    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    /// Runs at most one task.
    pub fn step(&mut self) -> StepOutcome {
        let now = self.clock.now();
        if let Some(tracker) = self.load_tracker.as_mut() {
            tracker.record_idle(now);
        }
        if self.lifecycle_state == SchedulingLifecycleState::Stopped {
            return StepOutcome::Wait(WakeRequest::None);
        }

        let immediate_ready = self.inbox.borrow_mut().tasks.has_ready_task(now);
        let held_until = if immediate_ready {
            self.throttled_until(now)
        } else {
            None
        };
        if immediate_ready && held_until.is_none() {
            self.run_immediate_task(now);
            return StepOutcome::RanImmediate;
        }

        let (idle_pending, next_delayed) = {
            let mut inbox = self.inbox.borrow_mut();
            (!inbox.idle_tasks.is_empty(), inbox.tasks.next_ready_time())
        };
        let next_wake = earliest(next_delayed, held_until);

        if self
            .idle_period
            .active_deadline()
            .is_some_and(|deadline| now >= deadline)
        {
            let reason = if idle_pending {
                IdlePeriodEndReason::DeadlineReached
            } else {
                IdlePeriodEndReason::Exhausted
            };
            self.idle_period.end_idle_period(now, reason);
        }

        match self.idle_period.state() {
            IdlePeriodState::InLongIdlePeriod if !idle_pending => {
                self.idle_period
                    .end_idle_period(now, IdlePeriodEndReason::Exhausted);
                StepOutcome::Wait(next_wake.into())
            }
            // Short periods belong to the host and last until their deadline.
            IdlePeriodState::InShortIdlePeriod if !idle_pending => {
                StepOutcome::Wait(earliest(next_wake, self.idle_period.active_deadline()).into())
            }
            IdlePeriodState::InLongIdlePeriod | IdlePeriodState::InShortIdlePeriod => {
                self.run_idle_task();
                StepOutcome::RanIdle
            }
            IdlePeriodState::NotInIdlePeriod if !idle_pending => {
                StepOutcome::Wait(next_wake.into())
            }
            IdlePeriodState::NotInIdlePeriod => self.enter_long_idle_period(now, held_until),
        }
    }

    fn throttling_active(&self) -> bool {
        self.throttling_enabled && self.lifecycle_state == SchedulingLifecycleState::Throttled
    }

    /// Time until which immediate work is held back by the CPU budget.
    fn throttled_until(&mut self, now: Ticks) -> Option<Ticks> {
        if !self.throttling_active() || self.budget.can_run_tasks_at(now) {
            return None;
        }
        let allowed_at = self.budget.next_allowed_run_time(now);
        self.metrics.throttled_steps += 1;
        trace!(at = %now, allowed_at = %allowed_at, "immediate work throttled");
        Some(allowed_at)
    }

    fn enter_long_idle_period(&mut self, now: Ticks, held_until: Option<Ticks>) -> StepOutcome {
        let (next_delayed, clip_to) = {
            let mut inbox = self.inbox.borrow_mut();
            let swept = inbox.tasks.sweep_cancelled();
            if swept > 0 {
                trace!(swept, "dropped cancelled tasks before idle period");
            }
            let next_delayed = inbox.tasks.next_ready_time();
            let max_deadline = now + self.idle_period.max_idle_period();
            let clip_to = next_delayed
                .filter(|_| inbox.tasks.has_pending_delayed_task_before(max_deadline));
            (next_delayed, clip_to)
        };
        match self
            .idle_period
            .try_enter_long_idle_period(now, clip_to, self.policy.as_mut())
        {
            EnterOutcome::Entered { deadline } => {
                debug_assert!(deadline >= now);
                self.metrics.long_idle_periods += 1;
                if !self.idle_period.can_exceed_idle_deadline_if_required() {
                    self.metrics.clipped_idle_periods += 1;
                }
                self.run_idle_task();
                StepOutcome::RanIdle
            }
            EnterOutcome::Deferred { retry_after } => {
                self.metrics.idle_period_deferrals += 1;
                let retry_at = Some(now + retry_after);
                StepOutcome::Wait(earliest(retry_at, earliest(next_delayed, held_until)).into())
            }
        }
    }

    fn run_immediate_task(&mut self, now: Ticks) {
        if self.idle_period.state() == IdlePeriodState::InLongIdlePeriod {
            self.idle_period
                .end_idle_period(now, IdlePeriodEndReason::ImmediateWork);
        }
        let task = self.inbox.borrow_mut().tasks.pop_next_ready_task(now);
        let Some(task) = task else {
            return;
        };
        trace!(sequence = task.sequence(), "running task");
        self.metrics.immediate_tasks_run += 1;
        let (start, end) = self.invoke(TaskKind::Immediate, task.into_callback());
        if self.throttling_active() {
            self.budget.record_task_run_time(start, end);
        }
        self.policy.on_immediate_task_ran(end);
    }

    fn run_idle_task(&mut self) {
        debug_assert!(self.idle_period.is_in_idle_period());
        let Some(deadline) = self.idle_period.active_deadline() else {
            return;
        };
        let task = self.inbox.borrow_mut().idle_tasks.pop_next_idle_task();
        let Some(task) = task else {
            return;
        };
        trace!(sequence = task.sequence(), deadline = %deadline, "running idle task");
        self.metrics.idle_tasks_run += 1;
        self.invoke(TaskKind::Idle, move || task.run(deadline));
    }

    fn invoke(&mut self, kind: TaskKind, callback: impl FnOnce()) -> (Ticks, Ticks) {
        let start = self.clock.now();
        for observer in &mut self.task_time_observers {
            observer.will_process_task(start);
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            self.metrics.task_panics += 1;
            error!(
                kind = kind.as_str(),
                panic = panic_message(payload.as_ref()),
                "task panicked"
            );
        }
        let end = self.clock.now();
        for observer in &mut self.task_time_observers {
            observer.did_process_task(start, end);
        }
        if let Some(tracker) = self.load_tracker.as_mut() {
            tracker.record_task_time(start, end);
        }
        (start, end)
    }

    /// Starts a host-driven idle period ending at `deadline`. Quiescence is
    /// not consulted. Returns the effective deadline.
    pub fn start_short_idle_period(&mut self, deadline: Ticks) -> Ticks {
        let now = self.clock.now();
        self.metrics.short_idle_periods += 1;
        self.idle_period.start_short_idle_period(now, deadline)
    }

    /// Ends the active idle period, if any.
    pub fn end_idle_period(&mut self) -> bool {
        let now = self.clock.now();
        self.idle_period
            .end_idle_period(now, IdlePeriodEndReason::Host)
    }

    #[must_use]
    pub fn idle_period_state(&self) -> IdlePeriodState {
        self.idle_period.state()
    }

    /// Deadline most recently handed to idle tasks.
    #[must_use]
    pub fn current_idle_task_deadline(&self) -> Ticks {
        self.idle_period.current_idle_task_deadline()
    }

    #[must_use]
    pub fn can_exceed_idle_deadline_if_required(&self) -> bool {
        self.idle_period.can_exceed_idle_deadline_if_required()
    }

    /// Worker threads have no higher-priority work to yield to.
    #[must_use]
    pub fn should_yield_for_high_priority_work(&self) -> bool {
        false
    }

    /// Whether any task, immediate, delayed or idle, is still queued.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        let inbox = self.inbox.borrow();
        !inbox.tasks.is_empty() || !inbox.idle_tasks.is_empty()
    }

    pub fn add_task_time_observer(&mut self, observer: impl TaskTimeObserver + 'static) {
        self.task_time_observers.push(Box::new(observer));
    }

    /// Registers an observer and immediately tells it the current state.
    pub fn add_lifecycle_observer(&mut self, observer: impl LifecycleObserver + 'static) {
        let mut observer = Box::new(observer);
        observer.on_lifecycle_state_changed(self.lifecycle_state);
        self.lifecycle_observers.push(observer);
    }

    #[must_use]
    pub fn lifecycle_state(&self) -> SchedulingLifecycleState {
        self.lifecycle_state
    }

    pub fn on_lifecycle_state_changed(&mut self, state: SchedulingLifecycleState) {
        if state == self.lifecycle_state {
            return;
        }
        debug!(from = ?self.lifecycle_state, to = ?state, "lifecycle state changed");
        self.lifecycle_state = state;
        for observer in &mut self.lifecycle_observers {
            observer.on_lifecycle_state_changed(state);
        }
    }

    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        let mut metrics = self.metrics;
        metrics.cancelled_tasks_dropped = self.inbox.borrow().tasks.cancelled_dropped();
        metrics
    }

    #[must_use]
    pub fn load_samples(&self) -> Vec<LoadSample> {
        self.load_tracker
            .as_ref()
            .map(LoadTracker::samples)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let (ready_tasks, delayed_tasks, idle_tasks, next_delayed_task) = {
            let mut inbox = self.inbox.borrow_mut();
            (
                inbox.tasks.ready_len(),
                inbox.tasks.delayed_len(),
                inbox.idle_tasks.len(),
                inbox.tasks.next_ready_time(),
            )
        };
        SchedulerSnapshot {
            at: self.clock.now(),
            idle_period_state: self.idle_period.state(),
            idle_deadline: self.idle_period.active_deadline(),
            current_idle_task_deadline: self.idle_period.current_idle_task_deadline(),
            ready_tasks,
            delayed_tasks,
            idle_tasks,
            next_delayed_task,
            lifecycle_state: self.lifecycle_state,
            metrics: self.metrics(),
            load_samples: self.load_samples(),
        }
    }

    /// Stops the scheduler, discarding queued work. Runner handles that
    /// outlive it reject further posts.
    pub fn shutdown(mut self) -> ShutdownReport {
        let now = self.clock.now();
        self.idle_period
            .end_idle_period(now, IdlePeriodEndReason::Host);
        let (tasks, idle_tasks) = {
            let mut inbox = self.inbox.borrow_mut();
            inbox.closed = true;
            inbox.tasks.sweep_cancelled();
            (
                std::mem::take(&mut inbox.tasks),
                std::mem::take(&mut inbox.idle_tasks),
            )
        };
        let mut metrics = self.metrics;
        metrics.cancelled_tasks_dropped = tasks.cancelled_dropped();
        let report = ShutdownReport {
            runtime: now.saturating_duration_since(self.started_at),
            dropped_tasks: tasks.len(),
            dropped_idle_tasks: idle_tasks.len(),
            metrics,
        };
        // Dropped outside the borrow: captured state may post on drop.
        drop(tasks);
        drop(idle_tasks);
        info!(
            runtime_ms = report.runtime.as_millis() as u64,
            dropped_tasks = report.dropped_tasks,
            dropped_idle_tasks = report.dropped_idle_tasks,
            "scheduler shut down"
        );
        report
    }
}
