//! isched: command-line front end for idlesched-core
//!
//! ```text
//! isched simulate --tasks "I1 D2 D3 D4" --delayed DELAYED@1000
//! isched simulate --script timeline.isched --format json
//! isched config
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use idlesched_core::config::{Config, LogFormat};
use idlesched_core::error::{Error, format_error_with_remediation};
use idlesched_core::logging::init_logging;
use idlesched_core::scenario::Scenario;

#[derive(Parser, Debug)]
#[command(
    name = "isched",
    version,
    about = "Replay and inspect idle-period scheduling timelines"
)]
struct Cli {
    /// Configuration file (TOML). Built-in defaults are used when omitted.
    #[arg(long, global = true, env = "ISCHED_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, a level or per-target directives; overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a scenario on a simulated clock and print the timeline
    Simulate {
        /// Scenario script (at / post / delayed / run / advance)
        #[arg(long, conflicts_with_all = ["tasks", "delayed"])]
        script: Option<PathBuf>,

        /// Tasks to post at time zero: D* immediate, I* idle
        #[arg(long)]
        tasks: Option<String>,

        /// Delayed immediate task, e.g. LATE@1000 (repeatable)
        #[arg(long, value_name = "LABEL@MS", value_parser = parse_delayed)]
        delayed: Vec<(String, Duration)>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

fn parse_delayed(value: &str) -> Result<(String, Duration), String> {
    let (label, millis) = value
        .split_once('@')
        .ok_or_else(|| format!("expected LABEL@MS, got `{value}`"))?;
    if label.is_empty() {
        return Err(format!("missing label in `{value}`"));
    }
    let millis = millis
        .strip_suffix("ms")
        .unwrap_or(millis)
        .parse::<u64>()
        .map_err(|_| format!("invalid delay in `{value}`"))?;
    Ok((label.to_string(), Duration::from_millis(millis)))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(core) = err.downcast_ref::<Error>() {
                eprintln!("{}", format_error_with_remediation(core));
            } else {
                eprintln!("Error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).map_err(Error::from)?,
        None => Config::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Command::Simulate {
            script,
            tasks,
            delayed,
            format,
        } => simulate(&config, script, tasks, &delayed, format),
        Command::Config => {
            print!("{}", config.to_toml_string().map_err(Error::from)?);
            Ok(())
        }
    }
}

fn simulate(
    config: &Config,
    script: Option<PathBuf>,
    tasks: Option<String>,
    delayed: &[(String, Duration)],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let scenario = if let Some(path) = script {
        let text = std::fs::read_to_string(&path).map_err(Error::from)?;
        Scenario::parse(&text).map_err(Error::from)?
    } else if tasks.is_some() || !delayed.is_empty() {
        Scenario::from_tasks(tasks.as_deref().unwrap_or_default(), delayed).map_err(Error::from)?
    } else {
        anyhow::bail!("nothing to simulate: pass --script FILE or --tasks \"D1 I2\"");
    };

    let timeline = scenario.replay(config).map_err(Error::from)?;
    tracing::debug!(
        events = timeline.events.len(),
        finished_at = %timeline.finished_at,
        "scenario replayed"
    );

    match format {
        OutputFormat::Plain => print!("{}", timeline.render_plain()),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&timeline).map_err(Error::from)?
        ),
    }
    Ok(())
}
