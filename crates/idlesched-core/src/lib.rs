//! idlesched-core: a cooperative single-threaded idle-period task scheduler
//!
//! Immediate tasks always run before idle tasks. Idle tasks run inside idle
//! periods and receive a deadline: long idle periods start once the thread
//! has been quiet for a quiescence delay and last at most the maximum idle
//! period, clipped to the next delayed task.
//!
//! # Architecture
//!
//! ```text
//! TaskRunner ──────► TaskQueue ───────┐
//!                                     ├──► Scheduler::step ──► StepOutcome
//! IdleTaskRunner ──► IdleTaskQueue ───┘         │
//!                                   IdlePeriodController ◄── QuiescencePolicy
//! ```
//!
//! # Modules
//!
//! - `clock`: `Ticks`, the `Clock` trait, wall and manual clocks
//! - `task_queue`: immediate and delayed tasks
//! - `idle_queue`: idle tasks
//! - `quiescence`: when a long idle period may start
//! - `idle_period`: idle period state and deadline computation
//! - `scheduler`: the step loop, runners, observers, metrics
//! - `budget`: lifecycle state and CPU-time budget throttling
//! - `load_tracker`: per-interval thread load
//! - `driver`: simulated-time host
//! - `scenario`: scripted runs producing timelines
//! - `worker`: OS-thread host
//! - `config`, `error`, `logging`: configuration, errors, tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod budget;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod idle_period;
pub mod idle_queue;
pub mod load_tracker;
pub mod logging;
pub mod quiescence;
pub mod scenario;
pub mod scheduler;
pub mod task_queue;
pub mod worker;

pub use clock::{Clock, ManualClock, Ticks, WallClock};
pub use config::Config;
pub use driver::SimulatedDriver;
pub use error::{Error, Result};
pub use scheduler::{
    IdleTaskRunner, Scheduler, SchedulerSnapshot, ShutdownReport, StepOutcome, TaskRunner,
    WakeRequest,
};
pub use worker::{WorkerHandle, WorkerThread};
