//! Scripted scheduler runs.
//!
//! A scenario is a small line-oriented script replayed on a
//! [`SimulatedDriver`]:
//!
//! ```text
//! at 5                # move the clock to 5ms (absolute)
//! post D1 I2 D3       # D* posts an immediate task, I* an idle task
//! delayed LATE 1000   # immediate task ready 1000ms from now
//! run                 # run until nothing is left to wait for
//! advance 100         # run while moving the clock 100ms forward
//! ```
//!
//! Replaying produces a [`Timeline`] of task runs and idle-period decisions.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Ticks};
use crate::config::Config;
use crate::driver::SimulatedDriver;
use crate::error::ScenarioError;
use crate::quiescence::{IdleGrant, QuiescenceMonitor, QuiescencePolicy};
use crate::scheduler::ShutdownReport;

/// A task to post, named by its label. `D*` labels are immediate, `I*` idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskToken {
    Default(String),
    Idle(String),
}

impl TaskToken {
    pub fn parse(token: &str, line: usize) -> Result<Self, ScenarioError> {
        match token.chars().next() {
            Some('D') => Ok(Self::Default(token.to_string())),
            Some('I') => Ok(Self::Idle(token.to_string())),
            _ => Err(ScenarioError::InvalidTaskToken {
                line,
                token: token.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Default(label) | Self::Idle(label) => label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    At(Ticks),
    Post(Vec<TaskToken>),
    Delayed { label: String, delay: Duration },
    Run,
    Advance(Duration),
}

/// Parses `300` or `300ms`.
fn parse_millis(value: &str, line: usize) -> Result<u64, ScenarioError> {
    value
        .strip_suffix("ms")
        .unwrap_or(value)
        .parse::<u64>()
        .map_err(|_| ScenarioError::InvalidDuration {
            line,
            value: value.to_string(),
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scenario {
    commands: Vec<(usize, Command)>,
}

impl Scenario {
    pub fn parse(text: &str) -> Result<Self, ScenarioError> {
        let mut commands = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or_default();
            let mut words = content.split_whitespace();
            let Some(name) = words.next() else {
                continue;
            };
            let missing = || ScenarioError::MissingArgument {
                line,
                command: name.to_string(),
            };
            let command = match name.to_ascii_lowercase().as_str() {
                "at" => {
                    let value = words.next().ok_or_else(missing)?;
                    Command::At(Ticks::from_millis(parse_millis(value, line)?))
                }
                "post" => {
                    let tokens = words
                        .map(|token| TaskToken::parse(token, line))
                        .collect::<Result<Vec<_>, _>>()?;
                    if tokens.is_empty() {
                        return Err(missing());
                    }
                    Command::Post(tokens)
                }
                "delayed" => {
                    let label = words.next().ok_or_else(missing)?;
                    let value = words.next().ok_or_else(missing)?;
                    Command::Delayed {
                        label: label.to_string(),
                        delay: Duration::from_millis(parse_millis(value, line)?),
                    }
                }
                "run" => Command::Run,
                "advance" => {
                    let value = words.next().ok_or_else(missing)?;
                    Command::Advance(Duration::from_millis(parse_millis(value, line)?))
                }
                _ => {
                    return Err(ScenarioError::UnknownCommand {
                        line,
                        command: name.to_string(),
                    });
                }
            };
            commands.push((line, command));
        }
        Ok(Self { commands })
    }

    /// Builds the script `post <tasks>`, one `delayed` per entry, then `run`.
    pub fn from_tasks(tasks: &str, delayed: &[(String, Duration)]) -> Result<Self, ScenarioError> {
        let tokens = tasks
            .split_whitespace()
            .map(|token| TaskToken::parse(token, 1))
            .collect::<Result<Vec<_>, _>>()?;
        let mut commands = Vec::new();
        if !tokens.is_empty() {
            commands.push((1, Command::Post(tokens)));
        }
        for (label, delay) in delayed {
            commands.push((
                1,
                Command::Delayed {
                    label: label.clone(),
                    delay: *delay,
                },
            ));
        }
        commands.push((1, Command::Run));
        Ok(Self { commands })
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter().map(|(_, command)| command)
    }

    /// Replays the script on a fresh simulated scheduler starting at time
    /// zero. Work still queued at the end shows up in the shutdown report.
    pub fn replay(&self, config: &Config) -> Result<Timeline, ScenarioError> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let policy = RecordingPolicy::new(
            QuiescenceMonitor::new(config.scheduler.quiescence_delay()),
            Rc::clone(&events),
        );
        let mut driver = SimulatedDriver::with_policy(config, Ticks::ZERO, policy);
        let clock = driver.clock();

        for (line, command) in &self.commands {
            match command {
                Command::At(target) => {
                    let now = driver.now();
                    if *target < now {
                        return Err(ScenarioError::TimeWentBackwards {
                            line: *line,
                            target_ms: target.as_millis(),
                            now_ms: now.as_millis(),
                        });
                    }
                    driver.fast_forward_by(target.saturating_duration_since(now));
                }
                Command::Post(tokens) => {
                    for token in tokens {
                        let events = Rc::clone(&events);
                        let clock = clock.clone();
                        let label = token.label().to_string();
                        match token {
                            TaskToken::Default(_) => {
                                driver.task_runner().post_task(move || {
                                    events.borrow_mut().push(TimelineEvent::TaskRan {
                                        at: clock.now(),
                                        label,
                                    });
                                });
                            }
                            TaskToken::Idle(_) => {
                                driver.idle_task_runner().post_idle_task(move |deadline| {
                                    events.borrow_mut().push(TimelineEvent::IdleTaskRan {
                                        at: clock.now(),
                                        label,
                                        deadline,
                                    });
                                });
                            }
                        }
                    }
                }
                Command::Delayed { label, delay } => {
                    let events = Rc::clone(&events);
                    let clock = clock.clone();
                    let label = label.clone();
                    driver.task_runner().post_delayed_task(
                        move || {
                            events.borrow_mut().push(TimelineEvent::TaskRan {
                                at: clock.now(),
                                label,
                            });
                        },
                        *delay,
                    );
                }
                Command::Run => {
                    driver.run_until_idle();
                }
                Command::Advance(delta) => {
                    driver.fast_forward_by(*delta);
                }
            }
        }

        let finished_at = driver.now();
        let report = driver.shutdown();
        let events = events.borrow().clone();
        Ok(Timeline {
            events,
            finished_at,
            report,
        })
    }
}

/// Something that happened during a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineEvent {
    TaskRan {
        at: Ticks,
        label: String,
    },
    IdleTaskRan {
        at: Ticks,
        label: String,
        deadline: Ticks,
    },
    NotQuiescent {
        at: Ticks,
    },
    IdlePeriodGranted {
        at: Ticks,
    },
    IdlePeriodDeferred {
        at: Ticks,
        retry_after_ms: u64,
    },
}

/// Wraps a [`QuiescenceMonitor`] and records its decisions.
#[derive(Debug)]
pub struct RecordingPolicy {
    inner: QuiescenceMonitor,
    events: Rc<RefCell<Vec<TimelineEvent>>>,
}

impl RecordingPolicy {
    #[must_use]
    pub fn new(inner: QuiescenceMonitor, events: Rc<RefCell<Vec<TimelineEvent>>>) -> Self {
        Self { inner, events }
    }
}

impl QuiescencePolicy for RecordingPolicy {
    fn can_enter_long_idle_period(&mut self, now: Ticks) -> IdleGrant {
        let grant = self.inner.can_enter_long_idle_period(now);
        let event = match grant {
            IdleGrant::Granted => TimelineEvent::IdlePeriodGranted { at: now },
            IdleGrant::Retry { after } => TimelineEvent::IdlePeriodDeferred {
                at: now,
                retry_after_ms: after.as_millis() as u64,
            },
        };
        self.events.borrow_mut().push(event);
        grant
    }

    fn on_immediate_task_ran(&mut self, now: Ticks) {
        let before = self.inner.not_quiescent_signals();
        self.inner.on_immediate_task_ran(now);
        if self.inner.not_quiescent_signals() > before {
            self.events
                .borrow_mut()
                .push(TimelineEvent::NotQuiescent { at: now });
        }
    }
}

/// Outcome of [`Scenario::replay`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub events: Vec<TimelineEvent>,
    pub finished_at: Ticks,
    pub report: ShutdownReport,
}

impl Timeline {
    /// Labels of every task that ran, in run order.
    #[must_use]
    pub fn run_order(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TimelineEvent::TaskRan { label, .. } | TimelineEvent::IdleTaskRan { label, .. } => {
                    Some(label.as_str())
                }
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        for event in &self.events {
            let _ = match event {
                TimelineEvent::TaskRan { at, label } => {
                    writeln!(output, "{:>12}  run            {label}", at.to_string())
                }
                TimelineEvent::IdleTaskRan {
                    at,
                    label,
                    deadline,
                } => writeln!(
                    output,
                    "{:>12}  run idle       {label} (deadline {deadline})",
                    at.to_string()
                ),
                TimelineEvent::NotQuiescent { at } => {
                    writeln!(output, "{:>12}  not quiescent", at.to_string())
                }
                TimelineEvent::IdlePeriodGranted { at } => {
                    writeln!(output, "{:>12}  idle granted", at.to_string())
                }
                TimelineEvent::IdlePeriodDeferred { at, retry_after_ms } => writeln!(
                    output,
                    "{:>12}  idle deferred  retry in {retry_after_ms}ms",
                    at.to_string()
                ),
            };
        }
        let metrics = &self.report.metrics;
        let _ = writeln!(
            output,
            "finished at {}: {} tasks, {} idle tasks, {} left unrun",
            self.finished_at,
            metrics.immediate_tasks_run,
            metrics.idle_tasks_run,
            self.report.dropped_tasks + self.report.dropped_idle_tasks
        );
        output
    }
}
