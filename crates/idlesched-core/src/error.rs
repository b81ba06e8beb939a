//! Error types for idlesched-core.
//!
//! Every domain error can describe how to recover from it; the CLI prints
//! that guidance under the error message.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// A command that helps diagnose or fix an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub label: String,
    pub command: String,
}

/// Recovery guidance attached to an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remediation {
    pub summary: String,
    pub steps: Vec<Step>,
    pub notes: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            steps: Vec::new(),
            notes: Vec::new(),
        }
    }

    #[must_use]
    pub fn step(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.steps.push(Step {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "To fix:")?;
        writeln!(f, "  {}", self.summary)?;
        for step in &self.steps {
            writeln!(f, "  $ {}  # {}", step.command, step.label)?;
        }
        for note in &self.notes {
            writeln!(f, "  note: {note}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scenario error: {0}")]
    Scenario(#[from] ScenarioError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Recovery guidance, when there is any to give.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Scenario(err) => Some(err.remediation()),
            Self::Worker(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check that the file exists and is readable.")
                    .step("Inspect the path", "ls -l <path>"),
            ),
            Self::Json(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("`{field}` {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound { path } => Remediation::new("Point --config at an existing file.")
                .step("Write the defaults there", format!("isched config > \"{}\"", path.display()))
                .note("Without --config the built-in defaults apply."),
            Self::Read { path, .. } => Remediation::new("Make the config file readable.")
                .step("Check permissions", format!("ls -l \"{}\"", path.display())),
            Self::Parse(_) | Self::Serialize(_) => {
                Remediation::new("Fix the TOML syntax; unknown keys are ignored.")
                    .step("Print a valid file", "isched config")
            }
            Self::Invalid { field, .. } => Remediation::new(format!("Change `{field}`."))
                .step("See the defaults", "isched config")
                .note("Durations are whole milliseconds."),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    #[error("line {line}: unknown command `{command}`")]
    UnknownCommand { line: usize, command: String },

    #[error("line {line}: `{command}` needs an argument")]
    MissingArgument { line: usize, command: String },

    #[error("line {line}: invalid task token `{token}` (expected D<name> or I<name>)")]
    InvalidTaskToken { line: usize, token: String },

    #[error("line {line}: invalid duration `{value}` (expected e.g. 300 or 300ms)")]
    InvalidDuration { line: usize, value: String },

    #[error("line {line}: `at {target_ms}ms` is earlier than the current time {now_ms}ms")]
    TimeWentBackwards {
        line: usize,
        target_ms: u64,
        now_ms: u64,
    },
}

impl ScenarioError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        let summary = match self {
            Self::TimeWentBackwards { .. } => "Keep `at` times increasing; use `advance` for relative steps.",
            Self::InvalidTaskToken { .. } => "Name tasks D<name> (immediate) or I<name> (idle).",
            _ => "Fix the scenario script and retry.",
        };
        Remediation::new(summary)
            .step("Try inline tasks", "isched simulate --tasks \"I1 D2 D3\"")
            .note("Script commands: at <ms>, post <tokens>, delayed <label> <ms>, run, advance <ms>.")
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker thread is no longer running")]
    Disconnected,

    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("worker thread panicked")]
    Panicked,
}

impl WorkerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Disconnected | Self::Panicked => {
                Remediation::new("The worker stopped; look for a panic in its logs and respawn it.")
                    .step("Rerun with scheduler logs", "RUST_LOG=idlesched_core=debug isched simulate --tasks D1")
            }
            Self::SpawnFailed(_) => Remediation::new("The OS refused to create a thread.")
                .step("Check the process limit", "ulimit -u"),
        }
    }
}

/// `Error: <message>` followed by the remediation block, if any.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    match error.remediation() {
        Some(remediation) => format!("Error: {error}\n\n{remediation}"),
        None => format!("Error: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_carry_steps() {
        let errors = vec![
            Error::Config(ConfigError::NotFound {
                path: PathBuf::from("isched.toml"),
            }),
            Error::Config(ConfigError::Read {
                path: PathBuf::from("isched.toml"),
                source: std::io::Error::other("denied"),
            }),
            Error::Config(ConfigError::invalid("scheduler.max_idle_period_ms", "must be positive")),
            Error::Scenario(ScenarioError::UnknownCommand {
                line: 1,
                command: "jump".to_string(),
            }),
            Error::Worker(WorkerError::Disconnected),
            Error::Worker(WorkerError::Panicked),
            Error::Io(std::io::Error::other("io")),
        ];

        for error in errors {
            let remediation = error.remediation().unwrap();
            assert!(!remediation.summary.is_empty(), "{error:?}");
            assert!(!remediation.steps.is_empty(), "{error:?}");
        }
    }

    #[test]
    fn json_errors_have_no_remediation() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let err = Error::Json(json_err);
        assert!(err.remediation().is_none());
        assert!(!format_error_with_remediation(&err).contains("To fix:"));
    }

    #[test]
    fn remediation_renders_steps_and_notes() {
        let text = Remediation::new("Fix it")
            .step("Diagnose", "isched config")
            .note("Try something else")
            .to_string();
        assert_eq!(
            text,
            "To fix:\n  Fix it\n  $ isched config  # Diagnose\n  note: Try something else\n"
        );
    }

    #[test]
    fn backwards_time_gets_specific_advice() {
        let err = ScenarioError::TimeWentBackwards {
            line: 4,
            target_ms: 10,
            now_ms: 300,
        };
        assert!(err.remediation().summary.contains("advance"));
        assert_eq!(
            err.to_string(),
            "line 4: `at 10ms` is earlier than the current time 300ms"
        );
    }

    #[test]
    fn formatted_error_appends_guidance() {
        let err = Error::Config(ConfigError::invalid("throttling.recovery_rate", "must be positive"));
        let output = format_error_with_remediation(&err);
        assert!(output.starts_with("Error: Config error: `throttling.recovery_rate` must be positive"));
        assert!(output.contains("To fix:\n  Change `throttling.recovery_rate`."));
    }
}
