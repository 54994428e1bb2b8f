//! Daemon configuration file.
//!
//! The file only configures the daemon itself (logging, the telemetry probe
//! and host commands). Monitor policy is read from the telemetry source on
//! every cycle.

use crate::congestion::{
    CongestionConfig, DEFAULT_CONGESTION_SAMPLE_INTERVAL, DEFAULT_CONGESTION_WINDOW,
};
use crate::host::{CommandTemplates, DEFAULT_COMMAND_TIMEOUT};
use anyhow::{Context, Result, bail};
use ddh_common::LogOptions;
use ddh_common::logging::DEFAULT_MAX_LOG_FILES;
use ddh_telemetry::probe::{DEFAULT_PROBE, DEFAULT_PROBE_TIMEOUT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ddh/ddhd.toml";

/// On-disk layout of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub ddhd: DaemonSection,
}

/// The `[ddhd]` section. Durations are humantime strings (`"90s"`, `"5m"`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSection {
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_rotate: Option<usize>,
    /// Roll the log file at this size in MiB instead of daily.
    pub log_size: Option<u64>,
    pub log_json: Option<bool>,
    pub probe: Option<PathBuf>,
    pub probe_timeout: Option<String>,
    pub command_timeout: Option<String>,
    pub congestion_window: Option<String>,
    pub congestion_sample_interval: Option<String>,
    pub commands: Option<CommandTemplates>,
}

/// Read the configuration file. A missing file is not an error.
pub fn load_file_config(path: &Path) -> Result<Option<FileConfig>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let config: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(config))
}

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_rotate: Option<usize>,
    pub log_size: Option<u64>,
    pub log_json: bool,
    pub probe: Option<PathBuf>,
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub log: LogOptions,
    pub probe: PathBuf,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub congestion: CongestionConfig,
    pub commands: CommandTemplates,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log: LogOptions::default(),
            probe: PathBuf::from(DEFAULT_PROBE),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            congestion: CongestionConfig::default(),
            commands: CommandTemplates::default(),
        }
    }
}

/// Merge the file section and command line over the defaults.
pub fn resolve(file: Option<FileConfig>, overrides: Overrides) -> Result<DaemonSettings> {
    let section = file.unwrap_or_default().ddhd;

    let log = LogOptions {
        level: overrides
            .log_level
            .or(section.log_level)
            .unwrap_or_else(|| LogOptions::default().level),
        file: overrides.log_file.or(section.log_file),
        max_files: overrides
            .log_rotate
            .or(section.log_rotate)
            .unwrap_or(DEFAULT_MAX_LOG_FILES),
        max_size_mb: overrides.log_size.or(section.log_size),
        json: overrides.log_json || section.log_json.unwrap_or(false),
    };

    if log.max_size_mb == Some(0) {
        bail!("log_size must be greater than zero");
    }

    let congestion = CongestionConfig {
        window: duration_or("congestion_window", section.congestion_window, DEFAULT_CONGESTION_WINDOW)?,
        sample_interval: duration_or(
            "congestion_sample_interval",
            section.congestion_sample_interval,
            DEFAULT_CONGESTION_SAMPLE_INTERVAL,
        )?,
        ..CongestionConfig::default()
    };
    if congestion.sample_interval > congestion.window {
        bail!(
            "congestion_sample_interval ({}) exceeds congestion_window ({})",
            humantime::format_duration(congestion.sample_interval),
            humantime::format_duration(congestion.window)
        );
    }

    Ok(DaemonSettings {
        log,
        probe: overrides
            .probe
            .or(section.probe)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROBE)),
        probe_timeout: duration_or("probe_timeout", section.probe_timeout, DEFAULT_PROBE_TIMEOUT)?,
        command_timeout: duration_or(
            "command_timeout",
            section.command_timeout,
            DEFAULT_COMMAND_TIMEOUT,
        )?,
        congestion,
        commands: section.commands.unwrap_or_default(),
    })
}

fn duration_or(key: &str, value: Option<String>, default: Duration) -> Result<Duration> {
    let Some(value) = value else {
        return Ok(default);
    };
    let duration = humantime::parse_duration(value.trim())
        .with_context(|| format!("invalid duration for {key}: {value:?}"))?;
    if duration.is_zero() {
        bail!("{key} must be greater than zero");
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = load_file_config(&tmp.path().join("ddhd.toml")).unwrap();
        assert!(loaded.is_none());

        let settings = resolve(loaded, Overrides::default()).unwrap();
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.log.max_files, DEFAULT_MAX_LOG_FILES);
        assert_eq!(settings.log.max_size_mb, None);
        assert_eq!(settings.probe, PathBuf::from(DEFAULT_PROBE));
        assert_eq!(settings.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(settings.congestion.window, DEFAULT_CONGESTION_WINDOW);
    }

    #[test]
    fn file_values_are_applied() {
        let file = write_config(
            r#"
[ddhd]
log_level = "debug"
log_file = "/var/log/ddh/ddhd.log"
log_rotate = 3
log_size = 4
probe = "/opt/ddh/probe"
probe_timeout = "30s"
command_timeout = "5m"
congestion_window = "10m"
congestion_sample_interval = "2m"

[ddhd.commands]
mount = ["hostctl", "mount", "{device}"]
"#,
        );
        let loaded = load_file_config(file.path()).unwrap();
        let settings = resolve(loaded, Overrides::default()).unwrap();

        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.log.file, Some(PathBuf::from("/var/log/ddh/ddhd.log")));
        assert_eq!(settings.log.max_files, 3);
        assert_eq!(settings.log.max_size_mb, Some(4));
        assert_eq!(settings.probe, PathBuf::from("/opt/ddh/probe"));
        assert_eq!(settings.probe_timeout, Duration::from_secs(30));
        assert_eq!(settings.command_timeout, Duration::from_secs(300));
        assert_eq!(settings.congestion.window, Duration::from_secs(600));
        assert_eq!(settings.congestion.sample_interval, Duration::from_secs(120));
        assert_eq!(settings.commands.mount, vec!["hostctl", "mount", "{device}"]);
        // Unlisted actions keep their defaults.
        assert_eq!(settings.commands.unmount, CommandTemplates::default().unmount);
    }

    #[test]
    fn command_line_wins_over_file() {
        let file = write_config("[ddhd]\nlog_level = \"debug\"\nlog_rotate = 3\nlog_size = 4\n");
        let loaded = load_file_config(file.path()).unwrap();
        let settings = resolve(
            loaded,
            Overrides {
                log_level: Some("warn".to_string()),
                log_rotate: Some(9),
                log_size: Some(16),
                log_json: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(settings.log.level, "warn");
        assert_eq!(settings.log.max_files, 9);
        assert_eq!(settings.log.max_size_mb, Some(16));
        assert!(settings.log.json);
    }

    #[test]
    fn zero_log_size_is_rejected() {
        let file = write_config("[ddhd]\nlog_size = 0\n");
        let loaded = load_file_config(file.path()).unwrap();
        let err = resolve(loaded, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("log_size"), "{err:#}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("[ddhd]\npoll_interval = 60\n");
        assert!(load_file_config(file.path()).is_err());
    }

    #[test]
    fn invalid_durations_are_rejected() {
        for bad in ["soon", "0s"] {
            let file = write_config(&format!("[ddhd]\nprobe_timeout = \"{bad}\"\n"));
            let loaded = load_file_config(file.path()).unwrap();
            let err = resolve(loaded, Overrides::default()).unwrap_err();
            assert!(err.to_string().contains("probe_timeout"), "{err:#}");
        }
    }

    #[test]
    fn sample_interval_must_fit_in_window() {
        let file = write_config(
            "[ddhd]\ncongestion_window = \"1m\"\ncongestion_sample_interval = \"2m\"\n",
        );
        let loaded = load_file_config(file.path()).unwrap();
        assert!(resolve(loaded, Overrides::default()).is_err());
    }
}
