//! Disk Device Health - storage device health monitor daemon.
//!
//! Polls device telemetry, diagnoses unhealthy devices and asks the host
//! storage stack to evacuate or remount them.

#![forbid(unsafe_code)]

mod config;
mod congestion;
mod device;
mod events;
mod evacuation;
mod host;
mod latency;
mod log_health;
mod reclaim;
mod registry;
mod remount;
mod scheduler;
mod smart;
#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;
use ddh_common::logging::log_dir_ready;
use ddh_common::{LogOptions, init_logging};
use ddh_telemetry::ProbeTelemetrySource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::{DEFAULT_CONFIG_PATH, Overrides};
use events::EventBus;
use host::CommandHost;
use scheduler::{MonitorScheduler, SchedulerOptions};

/// Attempts to wait for the log directory before falling back to stderr.
const LOG_DIR_RETRIES: u32 = 20;
const LOG_DIR_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "ddhd")]
#[command(author, version, about = "Disk Device Health - storage device health monitor")]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(short, long, env = "DDH_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter directive (e.g. info, debug, ddhd=trace)
    #[arg(long, env = "DDH_LOG_LEVEL")]
    loglevel: Option<String>,

    /// Log file; logs go to stderr only when unset
    #[arg(long, env = "DDH_LOG_FILE")]
    logfile: Option<PathBuf>,

    /// Number of rotated log files to keep
    #[arg(long, env = "DDH_LOG_ROTATE")]
    logrotate: Option<usize>,

    /// Roll the log file at this size in MiB instead of daily
    #[arg(long, env = "DDH_LOG_SIZE")]
    logsize: Option<u64>,

    /// Emit JSON log lines
    #[arg(long, env = "DDH_LOG_JSON")]
    log_json: bool,

    /// Telemetry probe program
    #[arg(long, env = "DDH_PROBE")]
    probe: Option<PathBuf>,

    /// Seed for latency interval sampling
    #[arg(long, hide = true)]
    seed: Option<u64>,

    /// Run a single monitor cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging is not up yet; a bad file is reported once it is.
    let (file, file_error) = match config::load_file_config(&cli.config) {
        Ok(file) => (file, None),
        Err(e) => (None, Some(e)),
    };
    let overrides = Overrides {
        log_level: cli.loglevel.clone(),
        log_file: cli.logfile.clone(),
        log_rotate: cli.logrotate,
        log_size: cli.logsize,
        log_json: cli.log_json,
        probe: cli.probe.clone(),
    };
    let (settings, settings_error) = match config::resolve(file, overrides.clone()) {
        Ok(settings) => (settings, None),
        Err(e) => (config::resolve(None, overrides)?, Some(e)),
    };

    let log = wait_for_log_dir(settings.log.clone()).await;
    let _logging = init_logging(&log)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ddhd");
    if let Some(e) = file_error.or(settings_error) {
        warn!("Ignoring daemon config {}: {e:#}", cli.config.display());
    }
    if settings.log.file.is_some() && log.file.is_none() {
        warn!("Log directory did not appear; logging to stderr only");
    }

    let shutdown = CancellationToken::new();
    let events = EventBus::default();
    let forwarder = events::spawn_log_forwarder(&events, shutdown.clone());

    let telemetry = Arc::new(
        ProbeTelemetrySource::new(settings.probe.clone()).with_timeout(settings.probe_timeout),
    );
    let host = Arc::new(CommandHost::new(
        settings.commands.clone(),
        settings.command_timeout,
    ));
    info!(
        probe = %settings.probe.display(),
        probe_timeout = ?settings.probe_timeout,
        command_timeout = ?settings.command_timeout,
        "Telemetry and host adapters configured"
    );

    let scheduler = Arc::new(MonitorScheduler::new(
        telemetry,
        host,
        events,
        SchedulerOptions {
            congestion: settings.congestion,
            seed: cli.seed,
        },
        shutdown.clone(),
    ));

    if cli.once {
        let report = scheduler.run_cycle().await;
        scheduler.shutdown().await;
        shutdown.cancel();
        join_forwarder(forwarder).await;
        let report = report?;
        info!(
            kind = ?report.kind,
            remounts = report.remounts.len(),
            evacuations = report.evacuations.len(),
            "Single cycle complete"
        );
        return Ok(());
    }

    let signals = tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));
    scheduler.run().await;
    shutdown.cancel();
    join_forwarder(forwarder).await;
    signals.abort();

    info!("ddhd stopped");
    Ok(())
}

async fn join_forwarder(forwarder: tokio::task::JoinHandle<()>) {
    if let Err(e) = forwarder.await {
        debug!("Event log forwarder ended abnormally: {e}");
    }
}

/// Wait for the log file's directory, dropping the file when it never appears.
async fn wait_for_log_dir(mut log: LogOptions) -> LogOptions {
    let Some(path) = log.file.clone() else {
        return log;
    };
    if !wait_for_dir(&path).await {
        log.file = None;
    }
    log
}

async fn wait_for_dir(path: &Path) -> bool {
    for _ in 0..LOG_DIR_RETRIES {
        if log_dir_ready(path) {
            return true;
        }
        tokio::time::sleep(LOG_DIR_RETRY_DELAY).await;
    }
    log_dir_ready(path)
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received interrupt");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt");
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "ddhd",
            "--config",
            "/tmp/ddhd.toml",
            "--loglevel",
            "debug",
            "--logrotate",
            "7",
            "--logsize",
            "2",
            "--once",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/ddhd.toml"));
        assert_eq!(cli.loglevel.as_deref(), Some("debug"));
        assert_eq!(cli.logrotate, Some(7));
        assert_eq!(cli.logsize, Some(2));
        assert!(cli.once);
        assert!(!cli.log_json);
    }

    #[tokio::test]
    async fn join_forwarder_tolerates_a_panicked_forwarder() {
        let forwarder = tokio::spawn(async { panic!("forwarder panicked") });
        join_forwarder(forwarder).await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_log_dir_falls_back_to_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let log = LogOptions {
            file: Some(tmp.path().join("missing").join("ddhd.log")),
            ..LogOptions::default()
        };
        assert!(wait_for_log_dir(log).await.file.is_none());
    }

    #[tokio::test]
    async fn existing_log_dir_keeps_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ddhd.log");
        let log = LogOptions {
            file: Some(path.clone()),
            ..LogOptions::default()
        };
        assert_eq!(wait_for_log_dir(log).await.file, Some(path));
    }
}
