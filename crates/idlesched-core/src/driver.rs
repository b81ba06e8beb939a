//! Deterministic host for tests and simulations.
//!
//! [`SimulatedDriver`] runs a [`Scheduler`] on a [`ManualClock`] and answers
//! its wake requests by moving the clock instead of sleeping.

use std::time::Duration;

use crate::clock::{Clock, ManualClock, Ticks};
use crate::config::Config;
use crate::quiescence::QuiescencePolicy;
use crate::scheduler::{
    IdleTaskRunner, Scheduler, ShutdownReport, StepOutcome, TaskRunner, WakeRequest,
};

#[derive(Debug)]
pub struct SimulatedDriver {
    scheduler: Scheduler,
    clock: ManualClock,
}

impl SimulatedDriver {
    /// Creates a driver whose clock starts at `start`.
    pub fn new(config: &Config, start: Ticks) -> Self {
        let clock = ManualClock::starting_at(start);
        let scheduler = Scheduler::new(config, clock.clone());
        Self { scheduler, clock }
    }

    pub fn with_policy(
        config: &Config,
        start: Ticks,
        policy: impl QuiescencePolicy + 'static,
    ) -> Self {
        let clock = ManualClock::starting_at(start);
        let scheduler = Scheduler::with_policy(config, clock.clone(), policy);
        Self { scheduler, clock }
    }

    #[must_use]
    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    /// A handle to the simulated clock. Tasks may advance it to model run
    /// time.
    #[must_use]
    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    #[must_use]
    pub fn task_runner(&self) -> TaskRunner {
        self.scheduler.task_runner()
    }

    #[must_use]
    pub fn idle_task_runner(&self) -> IdleTaskRunner {
        self.scheduler.idle_task_runner()
    }

    /// Runs everything runnable without moving the clock. Returns the number
    /// of tasks run and the wake request the scheduler ended on.
    pub fn run_pending(&mut self) -> (usize, WakeRequest) {
        let mut ran = 0;
        loop {
            match self.scheduler.step() {
                StepOutcome::RanImmediate | StepOutcome::RanIdle => ran += 1,
                StepOutcome::Wait(wake) => return (ran, wake),
            }
        }
    }

    /// Runs tasks, jumping the clock to each wake request, until the
    /// scheduler has nothing left to wait for. Returns the number of tasks
    /// run.
    pub fn run_until_idle(&mut self) -> usize {
        let mut ran = 0;
        loop {
            let (count, wake) = self.run_pending();
            ran += count;
            match wake {
                WakeRequest::None => return ran,
                WakeRequest::At(at) => {
                    debug_assert!(at > self.clock.now());
                    self.clock.advance_to(at);
                }
            }
        }
    }

    /// Runs tasks while moving the clock forward by `delta`, honouring every
    /// wake request that falls inside the window. Returns the number of
    /// tasks run.
    pub fn fast_forward_by(&mut self, delta: Duration) -> usize {
        let target = self.clock.now() + delta;
        let mut ran = 0;
        loop {
            let (count, wake) = self.run_pending();
            ran += count;
            match wake {
                WakeRequest::At(at) if at <= target => self.clock.advance_to(at),
                _ => break,
            }
        }
        self.clock.advance_to(target);
        ran + self.run_pending().0
    }

    pub fn shutdown(self) -> ShutdownReport {
        self.scheduler.shutdown()
    }
}
