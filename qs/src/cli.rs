//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// querystate - live execution-state snapshots
#[derive(Parser)]
#[command(
    name = "qs",
    about = "Snapshot the execution state of a simulated parallel query",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Helper processes launched by the simulated leader
    #[arg(long, global = true, default_value = "2")]
    pub helpers: usize,

    /// Nesting depth of the simulated leader's execution stack
    #[arg(long, global = true, default_value = "1")]
    pub depth: usize,

    /// Rows the simulated scan is planned to produce
    #[arg(long, global = true, default_value = "10000")]
    pub rows: u64,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Take one snapshot of the simulated leader and its helpers
    Snapshot {
        /// Plan format (text, xml, json, yaml)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Include output columns and helper pids in plans
        #[arg(long)]
        verbose: bool,

        /// Include planner estimates
        #[arg(long)]
        costs: bool,

        /// Include timing statistics
        #[arg(long)]
        timing: bool,

        /// Include buffer usage
        #[arg(long)]
        buffers: bool,

        /// Include trigger statistics
        #[arg(long)]
        triggers: bool,

        /// Output format
        #[arg(short, long, default_value = "table")]
        output: OutputFormat,
    },

    /// Poll progress of the simulated leader until it finishes
    Progress {
        /// Seconds between polls (at least 1)
        #[arg(short, long, default_value = "1")]
        interval: u64,
    },
}

/// Output format for snapshot rows
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "table" | "text" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: table or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("querystate")
        .join("logs")
        .join("querystate.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Help footer pointing at the log file
pub fn generate_after_help() -> String {
    format!("Logs:\n  {}\n", get_log_path().display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("table".parse::<OutputFormat>().unwrap(), OutputFormat::Table);
        assert!("csv".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }

    #[test]
    fn test_parse_snapshot_command() {
        let cli = Cli::try_parse_from([
            "qs", "--helpers", "3", "snapshot", "--format", "json", "--costs", "--output", "json",
        ])
        .unwrap();
        assert_eq!(cli.helpers, 3);
        assert_eq!(cli.depth, 1);
        match cli.command {
            Some(Command::Snapshot {
                format, costs, output, ..
            }) => {
                assert_eq!(format, "json");
                assert!(costs);
                assert_eq!(output, OutputFormat::Json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_progress_defaults() {
        let cli = Cli::try_parse_from(["qs", "progress"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Progress { interval: 1 })));
    }
}
