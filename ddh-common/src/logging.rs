//! Process-wide logging setup.
//!
//! Builds a `tracing_subscriber` registry with an `EnvFilter`, a stderr layer
//! and an optional rotating file layer backed by `tracing-appender`. The file
//! rolls daily, or by size when a size limit is configured.

use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

/// Default number of rotated log files kept on disk.
pub const DEFAULT_MAX_LOG_FILES: usize = 5;

/// Logging options resolved from the command line and the daemon config file.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is not set (e.g. `info`, `ddhd=debug`).
    pub level: String,
    /// Log file; stderr only when `None`.
    pub file: Option<PathBuf>,
    /// Rotated files kept next to `file`.
    pub max_files: usize,
    /// Roll the file once it reaches this many MiB instead of daily.
    pub max_size_mb: Option<u64>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: DEFAULT_MAX_LOG_FILES,
            max_size_mb: None,
            json: false,
        }
    }
}

/// Keeps the non-blocking file writer alive. Drop it last.
#[must_use]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
pub fn init_logging(options: &LogOptions) -> anyhow::Result<LoggingGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&options.level)
            .with_context(|| format!("invalid log level {:?}", options.level))?,
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(if options.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    });

    let mut guard = None;
    if let Some(path) = &options.file {
        let (writer, file_guard) = match options.max_size_mb {
            Some(mb) => {
                let bytes = mb.saturating_mul(1024 * 1024);
                let file = SizeRollingWriter::open(path, bytes, options.max_files)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(rolling_appender(path, options.max_files)?),
        };
        layers.push(if options.json {
            fmt::layer().json().with_ansi(false).with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("failed to install global tracing subscriber")?;

    Ok(LoggingGuard { _file: guard })
}

/// Daily rotating appender for `path`, keeping at most `max_files` files.
pub fn rolling_appender(path: &Path, max_files: usize) -> anyhow::Result<RollingFileAppender> {
    let (dir, prefix) = split_log_path(path)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(max_files.max(1))
        .build(dir)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Log file that rolls over once it reaches `max_bytes`.
///
/// On rollover `ddhd.log.1` becomes `ddhd.log.2` and so on, `ddhd.log` becomes
/// `ddhd.log.1`, and anything past `max_files` is removed.
#[derive(Debug)]
pub struct SizeRollingWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    file: File,
    written: u64,
}

impl SizeRollingWriter {
    pub fn open(path: &Path, max_bytes: u64, max_files: usize) -> io::Result<Self> {
        let file = open_append(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes: max_bytes.max(1),
            max_files: max_files.max(1),
            file,
            written,
        })
    }

    fn rotated(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        match fs::remove_file(self.rotated(self.max_files)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        for index in (1..self.max_files).rev() {
            let from = self.rotated(index);
            if from.exists() {
                fs::rename(&from, self.rotated(index + 1))?;
            }
        }
        fs::rename(&self.path, self.rotated(1))?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A single oversized record still goes into an empty file.
        if self.written > 0 && self.written.saturating_add(buf.len() as u64) > self.max_bytes {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Whether the directory that will hold `path` exists yet.
pub fn log_dir_ready(path: &Path) -> bool {
    match split_log_path(path) {
        Ok((dir, _)) => dir.is_dir(),
        Err(_) => false,
    }
}

fn split_log_path(path: &Path) -> anyhow::Result<(PathBuf, String)> {
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("log path {} has no file name", path.display()))?
        .to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, prefix))
}
