//! querystate - live execution-state snapshots
//!
//! CLI entry point: starts an in-process host with a simulated parallel query
//! and inspects it.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use querystate::cli::{Cli, Command, OutputFormat, generate_after_help};
use querystate::config::Config;
use querystate::coordinator::{QueryStateReport, QueryStateRequest, pg_query_state};
use querystate::host::{Backend, Host, Pid, UserId};
use querystate::progress::progress_bar_visual;
use querystate::sim::SimulatedJob;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("querystate")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("querystate.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        enable = config.module.enable,
        receive_timeout_ms = config.transport.receive_timeout_ms,
        "querystate loaded config"
    );

    let Some(command) = cli.command else {
        Cli::command().after_help(generate_after_help()).print_help()?;
        return Ok(());
    };

    let host = Host::new(&config);
    let job = SimulatedJob {
        helpers: cli.helpers,
        depth: cli.depth,
        rows: cli.rows,
        ..Default::default()
    };
    let running = job.spawn(&host);
    let requester = host.spawn_backend(UserId(0), true);

    debug!(?command, "main: dispatching command");
    let result = match command {
        Command::Snapshot {
            format,
            verbose,
            costs,
            timing,
            buffers,
            triggers,
            output,
        } => {
            let request = QueryStateRequest {
                verbose,
                costs,
                timing,
                buffers,
                triggers,
                ..QueryStateRequest::new(running.leader())
            }
            .with_format(&format);
            match request {
                Ok(request) => cmd_snapshot(&requester, &request, output).await,
                Err(e) => Err(e.into()),
            }
        }
        Command::Progress { interval } => cmd_progress(&requester, running.leader(), interval).await,
    };

    drop(requester);
    running.shutdown().await;
    result
}

async fn cmd_snapshot(requester: &Backend, request: &QueryStateRequest, output: OutputFormat) -> Result<()> {
    debug!(target_pid = %request.pid, %output, "cmd_snapshot: called");
    let report = pg_query_state(requester, request)
        .await
        .context(format!("Failed to snapshot process {}", request.pid))?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &QueryStateReport) {
    if let Some(notice) = report.notice() {
        println!("{}", notice.yellow());
        return;
    }
    for warning in report.warnings() {
        eprintln!("{} {}", "warning:".yellow().bold(), warning);
    }
    for row in report.rows() {
        let leader = row.leader_pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{} {}  {} {}  {} {}",
            "pid".bold(),
            row.pid.to_string().cyan(),
            "frame".bold(),
            row.frame_number,
            "leader".bold(),
            leader
        );
        println!("  {}", row.query_text.green());
        for line in row.plan.lines() {
            println!("    {}", line);
        }
    }
}

async fn cmd_progress(requester: &Backend, pid: Pid, interval: u64) -> Result<()> {
    debug!(%pid, interval, "cmd_progress: called");
    let progress = progress_bar_visual(requester, pid, Duration::from_secs(interval), |p| {
        println!("Progress = {:.6}", p);
    })
    .await
    .context(format!("Failed to poll progress of process {}", pid))?;

    if progress < 0.0 {
        println!("{}", "counting progress is not available".yellow());
    } else {
        println!("{}", "done".green());
    }
    Ok(())
}
