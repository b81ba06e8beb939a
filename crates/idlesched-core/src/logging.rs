//! Structured logging setup.
//!
//! The scheduler itself only emits `tracing` events; hosts decide where they
//! go by calling [`init_logging`] once at startup. Event fields used across
//! the crate:
//!
//! - `at`: scheduler time of the event
//! - `deadline`: idle deadline handed out
//! - `retry_after_ms`: remaining quiescence delay when a long idle period is
//!   refused
//! - `sequence`: task sequence number
//!
//! `RUST_LOG` takes precedence over the configured filter, e.g.
//! `RUST_LOG=idlesched_core::quiescence=trace`.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt};

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive: a level (`debug`) or per-target directives
    /// (`info,idlesched_core::scheduler=trace`)
    pub level: String,

    pub format: LogFormat,

    /// Mirror every event to this file, appending
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Parses `level` as an [`EnvFilter`] directive.
    pub fn filter(&self) -> Result<EnvFilter, LogError> {
        EnvFilter::try_new(&self.level).map_err(|err| LogError::InvalidFilter {
            directive: self.level.clone(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter `{directive}`: {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("failed to open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// One formatting layer writing to `writer` in `format`.
pub fn fmt_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_names(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_log_file(path: &Path) -> Result<File, LogError> {
    let open = || -> io::Result<File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    };
    open().map_err(|source| LogError::OpenFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Installs the global subscriber: stderr plus the optional file mirror.
///
/// Only the first call installs anything; later calls fail with
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let configured = config.filter()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);
    let file_layer = match &config.file {
        Some(path) => Some(fmt_layer(config.format, Mutex::new(open_log_file(path)?), false)),
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(config.format, io::stderr, true))
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(());

    tracing::debug!(
        filter = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging initialized"
    );
    Ok(())
}
