//! `tracing` subscriber setup for binaries embedding the image cache.
//!
//! The library itself only emits events. Hosts that have no subscriber of their own can call
//! [`init`] once at startup to get a stderr sink and, optionally, a rolling file under
//! [`LogConfig::directory`]. Records emitted through the `log` crate are forwarded as well.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, util::SubscriberInitExt};

const ENV_FILTER_VARS: [&str; 2] = ["IMAGE_CACHE_LOG", "RUST_LOG"];

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

pub use tracing_subscriber::filter::LevelFilter as LogLevel;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogRolling {
    Hourly,
    Daily,
    /// Single append-only file.
    Never,
}

impl LogRolling {
    fn rotation(self) -> Rotation {
        match self {
            LogRolling::Hourly => Rotation::HOURLY,
            LogRolling::Daily => Rotation::DAILY,
            LogRolling::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Where rolling log files go. `None` logs to stderr only.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    /// Number of rolled files to keep; `None` keeps everything.
    pub retention: Option<usize>,
    pub file_level: LevelFilter,
    pub console_level: LevelFilter,
    /// Forward `log` crate records into `tracing`.
    pub capture_log: bool,
    /// Filter directive such as `imgcache_core=debug`. Falls back to `IMAGE_CACHE_LOG`/`RUST_LOG`.
    pub env_filter: Option<String>,
    pub rolling: LogRolling,
}

impl Default for LogConfig {
    fn default() -> Self {
        let console_level =
            if cfg!(debug_assertions) { LevelFilter::INFO } else { LevelFilter::WARN };

        Self {
            directory: Some(default_log_directory()),
            file_prefix: "image-cache".to_string(),
            retention: Some(7),
            file_level: LevelFilter::DEBUG,
            console_level,
            capture_log: true,
            env_filter: None,
            rolling: LogRolling::Daily,
        }
    }
}

impl LogConfig {
    /// Console-only configuration.
    pub fn stderr() -> Self {
        Self { directory: None, ..Self::default() }
    }

    pub fn with_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory = Some(path.into());
        self
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    pub fn with_retention(mut self, retention: Option<usize>) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_rolling(mut self, rolling: LogRolling) -> Self {
        self.rolling = rolling;
        self
    }

    pub fn with_env_filter<S: Into<String>>(mut self, directive: S) -> Self {
        self.env_filter = Some(directive.into());
        self
    }

    fn directive(&self) -> String {
        self.env_filter
            .clone()
            .or_else(|| ENV_FILTER_VARS.iter().find_map(|var| std::env::var(var).ok()))
            .filter(|directive| !directive.trim().is_empty())
            .unwrap_or_else(|| if cfg!(debug_assertions) { "debug" } else { "info" }.to_string())
    }
}

/// Keeps the background file writer alive for the lifetime of the process.
#[derive(Debug)]
pub struct LogHandle {
    _guard: Option<WorkerGuard>,
    directory: Option<PathBuf>,
}

impl LogHandle {
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }
}

/// Install the global subscriber. The first call wins; later calls return the same handle and
/// ignore their configuration.
pub fn init(config: LogConfig) -> Result<&'static LogHandle> {
    if let Some(handle) = LOG_HANDLE.get() {
        return Ok(handle);
    }

    let handle = setup(config)?;
    Ok(LOG_HANDLE.get_or_init(|| handle))
}

fn setup(config: LogConfig) -> Result<LogHandle> {
    if config.capture_log {
        install_log_tracer(config.file_level.max(config.console_level));
    }

    let env_filter =
        EnvFilter::try_new(config.directive()).context("parsing log filter directive")?;
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(config.console_level);

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            let (writer, guard) = file_writer(&config, directory)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_line_number(true)
                .with_filter(config.file_level);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))?;

    Ok(LogHandle { _guard: guard, directory: config.directory })
}

fn file_writer(
    config: &LogConfig,
    directory: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    fs::create_dir_all(directory)
        .with_context(|| format!("creating log directory at {}", directory.display()))?;

    if let Some(retention) = config.retention.filter(|r| *r > 0) {
        prune_old_logs(directory, &config.file_prefix, retention)?;
    }

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(config.rolling.rotation())
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(directory)
        .context("creating rolling log appender")?;

    Ok(tracing_appender::non_blocking(appender))
}

fn install_log_tracer(max_level: LevelFilter) {
    let level = match max_level {
        LevelFilter::OFF => log::LevelFilter::Off,
        LevelFilter::ERROR => log::LevelFilter::Error,
        LevelFilter::WARN => log::LevelFilter::Warn,
        LevelFilter::INFO => log::LevelFilter::Info,
        LevelFilter::DEBUG => log::LevelFilter::Debug,
        LevelFilter::TRACE => log::LevelFilter::Trace,
    };

    // Another logger may already own the `log` facade.
    let _ = tracing_log::LogTracer::builder().with_max_level(level).init();
}

/// Delete the oldest files carrying `prefix` until at most `retention` remain.
fn prune_old_logs(dir: &Path, prefix: &str, retention: usize) -> Result<usize> {
    let mut entries: Vec<(PathBuf, SystemTime)> = fs::read_dir(dir)
        .with_context(|| format!("reading log directory at {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter(|entry| has_prefix(&entry.path(), prefix))
        .map(|entry| {
            let modified =
                entry.metadata().and_then(|meta| meta.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    if entries.len() <= retention {
        return Ok(0);
    }

    entries.sort_by_key(|(_, modified)| *modified);
    let excess = entries.len() - retention;
    let removed = entries
        .into_iter()
        .take(excess)
        .filter(|(path, _)| fs::remove_file(path).is_ok())
        .count();
    Ok(removed)
}

fn has_prefix(path: &Path, prefix: &str) -> bool {
    path.file_name().and_then(OsStr::to_str).is_some_and(|name| name.starts_with(prefix))
}

fn default_log_directory() -> PathBuf {
    match directories::ProjectDirs::from("com", "Vermeil", "image-cache") {
        Some(dirs) => dirs.data_dir().join("logs"),
        None => std::env::temp_dir().join("image-cache-logs"),
    }
}
