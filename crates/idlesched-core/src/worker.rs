//! Real-time host: a scheduler on its own OS thread.
//!
//! The scheduler itself is single-threaded and never leaves the worker
//! thread. Other threads talk to it through a cloneable [`WorkerHandle`]
//! backed by a crossbeam channel; the worker blocks on that channel until
//! the scheduler's next wake request.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::budget::SchedulingLifecycleState;
use crate::clock::{Clock, Ticks, WallClock};
use crate::config::Config;
use crate::error::WorkerError;
use crate::scheduler::{
    Scheduler, SchedulerSnapshot, ShutdownReport, StepOutcome, WakeRequest,
};

type SendTask = Box<dyn FnOnce() + Send>;
type SendIdleTask = Box<dyn FnOnce(Ticks) + Send>;

enum Message {
    Task(SendTask),
    DelayedTask(SendTask, Duration),
    IdleTask(SendIdleTask),
    Lifecycle(SchedulingLifecycleState),
    Snapshot(Sender<SchedulerSnapshot>),
    Shutdown,
}

/// Posts work to a [`WorkerThread`] from any thread.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    sender: Sender<Message>,
}

impl WorkerHandle {
    fn send(&self, message: Message) -> Result<(), WorkerError> {
        self.sender
            .send(message)
            .map_err(|_| WorkerError::Disconnected)
    }

    pub fn post_task(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), WorkerError> {
        self.send(Message::Task(Box::new(callback)))
    }

    /// The delay is measured from when the worker receives the task.
    pub fn post_delayed_task(
        &self,
        callback: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<(), WorkerError> {
        self.send(Message::DelayedTask(Box::new(callback), delay))
    }

    pub fn post_idle_task(
        &self,
        callback: impl FnOnce(Ticks) + Send + 'static,
    ) -> Result<(), WorkerError> {
        self.send(Message::IdleTask(Box::new(callback)))
    }

    pub fn set_lifecycle_state(&self, state: SchedulingLifecycleState) -> Result<(), WorkerError> {
        self.send(Message::Lifecycle(state))
    }

    /// Asks the worker for a snapshot and waits for it.
    pub fn snapshot(&self) -> Result<SchedulerSnapshot, WorkerError> {
        let (reply, response) = channel::bounded(1);
        self.send(Message::Snapshot(reply))?;
        response.recv().map_err(|_| WorkerError::Disconnected)
    }
}

/// Owns the worker thread. Dropping it without calling
/// [`shutdown`](Self::shutdown) still stops and joins the thread.
#[derive(Debug)]
pub struct WorkerThread {
    handle: WorkerHandle,
    clock: WallClock,
    join: Option<JoinHandle<ShutdownReport>>,
}

impl WorkerThread {
    pub fn spawn(config: Config) -> Result<Self, WorkerError> {
        let (sender, receiver) = channel::unbounded();
        let clock = WallClock::new();
        let join = thread::Builder::new()
            .name("isched-worker".to_string())
            .spawn(move || run_worker(&config, clock, &receiver))
            .map_err(WorkerError::SpawnFailed)?;
        Ok(Self {
            handle: WorkerHandle { sender },
            clock,
            join: Some(join),
        })
    }

    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// The worker's clock. Its readings are comparable with the deadlines
    /// handed to idle tasks.
    #[must_use]
    pub fn clock(&self) -> WallClock {
        self.clock
    }

    /// Stops the worker, discarding queued work, and waits for it to exit.
    pub fn shutdown(mut self) -> Result<ShutdownReport, WorkerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<ShutdownReport, WorkerError> {
        let Some(join) = self.join.take() else {
            return Err(WorkerError::Disconnected);
        };
        // A worker that already exited has dropped its receiver.
        let _ = self.handle.send(Message::Shutdown);
        join.join().map_err(|_| WorkerError::Panicked)
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            if let Err(err) = self.stop() {
                warn!(error = %err, "worker did not shut down cleanly");
            }
        }
    }
}

fn run_worker(config: &Config, clock: WallClock, receiver: &Receiver<Message>) -> ShutdownReport {
    let mut scheduler = Scheduler::new(config, clock);
    info!("worker started");
    'worker: loop {
        let first = match scheduler.step() {
            StepOutcome::RanImmediate | StepOutcome::RanIdle => match receiver.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Message::Shutdown),
            },
            StepOutcome::Wait(WakeRequest::None) => {
                Some(receiver.recv().unwrap_or(Message::Shutdown))
            }
            StepOutcome::Wait(WakeRequest::At(at)) => {
                let timeout = at.saturating_duration_since(clock.now());
                match receiver.recv_timeout(timeout) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(Message::Shutdown),
                }
            }
        };
        let Some(first) = first else {
            continue;
        };
        if !dispatch(&mut scheduler, first) {
            break;
        }
        // Drain whatever else arrived before stepping again.
        while let Ok(message) = receiver.try_recv() {
            if !dispatch(&mut scheduler, message) {
                break 'worker;
            }
        }
    }
    scheduler.shutdown()
}

/// Applies one message. Returns `false` on shutdown.
fn dispatch(scheduler: &mut Scheduler, message: Message) -> bool {
    match message {
        Message::Task(task) => {
            scheduler.task_runner().post_task(task);
        }
        Message::DelayedTask(task, delay) => {
            scheduler.task_runner().post_delayed_task(task, delay);
        }
        Message::IdleTask(task) => {
            scheduler.idle_task_runner().post_idle_task(task);
        }
        Message::Lifecycle(state) => scheduler.on_lifecycle_state_changed(state),
        Message::Snapshot(reply) => {
            if reply.send(scheduler.snapshot()).is_err() {
                debug!("snapshot requester went away");
            }
        }
        Message::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle_period::IdlePeriodState;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.scheduler.quiescence_delay_ms = 10;
        config.scheduler.max_idle_period_ms = 20;
        config
    }

    #[test]
    fn runs_tasks_posted_from_other_threads() {
        let worker = WorkerThread::spawn(fast_config()).unwrap();
        let (tx, rx) = channel::unbounded();
        let handle = worker.handle();
        let poster = thread::spawn(move || {
            for i in 0..3 {
                let tx = tx.clone();
                handle.post_task(move || tx.send(i).unwrap()).unwrap();
            }
        });
        poster.join().unwrap();
        let received: Vec<i32> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
        assert_eq!(received, vec![0, 1, 2]);
        let report = worker.shutdown().unwrap();
        assert_eq!(report.metrics.immediate_tasks_run, 3);
    }

    #[test]
    fn idle_task_waits_for_quiescence() {
        let worker = WorkerThread::spawn(fast_config()).unwrap();
        let clock = worker.clock();
        let handle = worker.handle();
        let (tx, rx) = channel::unbounded();

        let task_tx = tx.clone();
        handle
            .post_task(move || task_tx.send(("task", clock.now(), None)).unwrap())
            .unwrap();
        handle
            .post_idle_task(move |deadline| tx.send(("idle", clock.now(), Some(deadline))).unwrap())
            .unwrap();

        let (first, task_at, _) = rx.recv_timeout(TIMEOUT).unwrap();
        let (second, idle_at, deadline) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!((first, second), ("task", "idle"));
        assert!(idle_at.saturating_duration_since(task_at) >= Duration::from_millis(10));
        assert!(deadline.unwrap() <= idle_at + Duration::from_millis(20));
        worker.shutdown().unwrap();
    }

    #[test]
    fn delayed_task_runs_after_delay() {
        let worker = WorkerThread::spawn(fast_config()).unwrap();
        let clock = worker.clock();
        let (tx, rx) = channel::unbounded();
        let posted_at = clock.now();
        worker
            .handle()
            .post_delayed_task(move || tx.send(clock.now()).unwrap(), Duration::from_millis(15))
            .unwrap();
        let ran_at = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(ran_at.saturating_duration_since(posted_at) >= Duration::from_millis(15));
        worker.shutdown().unwrap();
    }

    #[test]
    fn snapshot_and_lifecycle_round_trip() {
        let worker = WorkerThread::spawn(fast_config()).unwrap();
        let handle = worker.handle();
        handle
            .set_lifecycle_state(SchedulingLifecycleState::Hidden)
            .unwrap();
        let snapshot = handle.snapshot().unwrap();
        assert_eq!(snapshot.lifecycle_state, SchedulingLifecycleState::Hidden);
        assert_eq!(snapshot.idle_period_state, IdlePeriodState::NotInIdlePeriod);
        worker.shutdown().unwrap();
    }

    #[test]
    fn handle_reports_disconnect_after_shutdown() {
        let worker = WorkerThread::spawn(fast_config()).unwrap();
        let handle = worker.handle();
        handle
            .post_delayed_task(|| {}, Duration::from_secs(60))
            .unwrap();
        // Make sure the delayed task has been received before shutting down.
        assert_eq!(handle.snapshot().unwrap().delayed_tasks, 1);
        let report = worker.shutdown().unwrap();
        assert_eq!(report.dropped_tasks, 1);
        assert!(matches!(
            handle.post_task(|| {}),
            Err(WorkerError::Disconnected)
        ));
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let worker = WorkerThread::spawn(fast_config()).unwrap();
        let (tx, rx) = channel::unbounded();
        let handle = worker.handle();
        handle.post_task(|| panic!("task failure")).unwrap();
        handle.post_task(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(TIMEOUT).unwrap();
        let report = worker.shutdown().unwrap();
        assert_eq!(report.metrics.task_panics, 1);
    }

    #[test]
    fn dropping_worker_joins_thread() {
        let worker = WorkerThread::spawn(fast_config()).unwrap();
        let handle = worker.handle();
        drop(worker);
        assert!(handle.post_task(|| {}).is_err());
    }
}
