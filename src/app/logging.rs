//! Usage: Tracing/logging initialization (rolling file logs + best-effort cleanup).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;

const LOG_FILE_PREFIX: &str = "aio-relay-gateway.log";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_RETENTION_DAYS: u32 = 7;

static TRACING_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log dir {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read log dir: {0}")]
    ReadDir(#[source] std::io::Error),
    #[error("failed to set global tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("logging guard mutex poisoned")]
    GuardPoisoned,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Daily rolling files go here; `None` disables file logging.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_stdout")]
    pub stdout: bool,
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_stdout() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            stdout: true,
        }
    }
}

/// Installs the global subscriber once; later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    TRACING_INIT.get_or_init(|| {
        if let Err(err) = init_impl(config) {
            // Last-resort fallback: stderr logger.
            let _ = tracing_subscriber::fmt()
                .with_env_filter(default_env_filter())
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .try_init();
            eprintln!("tracing init failed: {err}");
        }
    });
}

fn init_impl(config: &LoggingConfig) -> Result<(), LoggingError> {
    let file_layer = match config.log_dir.as_deref() {
        Some(dir) => {
            ensure_log_dir(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            TRACING_GUARD
                .get_or_init(|| Mutex::new(None))
                .lock()
                .map_err(|_| LoggingError::GuardPoisoned)?
                .replace(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let stdout_layer = config.stdout.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let subscriber = tracing_subscriber::registry()
        .with(default_env_filter())
        .with(file_layer)
        .with(stdout_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    // Capture `log` crate records (from dependencies) into `tracing` when possible.
    let _ = tracing_log::LogTracer::init();

    match config.log_dir.clone() {
        Some(dir) => {
            tracing::info!(log_dir = %dir.display(), "tracing initialized");
            spawn_cleanup_task(dir, config.retention_days);
        }
        None => tracing::info!("tracing initialized without file output"),
    }
    Ok(())
}

fn default_env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            tracing_subscriber::EnvFilter::new("info,aio_relay_gateway=debug")
        }
        #[cfg(not(debug_assertions))]
        {
            tracing_subscriber::EnvFilter::new("info")
        }
    })
}

fn ensure_log_dir(dir: &Path) -> Result<(), LoggingError> {
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Runs once now, then daily when a tokio runtime is available.
fn spawn_cleanup_task(log_dir: PathBuf, retention_days: u32) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        cleanup_once(&log_dir, retention_days);
        return;
    };
    handle.spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let dir = log_dir.clone();
            if let Err(err) =
                tokio::task::spawn_blocking(move || cleanup_once(&dir, retention_days)).await
            {
                tracing::warn!("log cleanup task failed: {}", err);
            }
        }
    });
}

fn cleanup_once(log_dir: &Path, retention_days: u32) {
    match cleanup_logs(log_dir, retention_days) {
        Ok(deleted) if deleted > 0 => {
            tracing::info!(retention_days, deleted, "cleaned up old log files");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(retention_days, "log cleanup failed: {}", err);
        }
    }
}

/// Deletes rolled log files last modified more than `retention_days` ago.
pub(crate) fn cleanup_logs(log_dir: &Path, retention_days: u32) -> Result<usize, LoggingError> {
    let retention_days = retention_days.max(1);
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(
            u64::from(retention_days).saturating_mul(24 * 60 * 60),
        ))
        .unwrap_or(UNIX_EPOCH);

    let mut deleted = 0usize;
    for entry in std::fs::read_dir(log_dir).map_err(LoggingError::ReadDir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("log cleanup: read_dir entry error: {}", err);
                continue;
            }
        };

        let path = entry.path();
        let is_log = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(v) if v.is_file() => v,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(path = %path.display(), "log cleanup: metadata error: {}", err);
                continue;
            }
        };
        if meta.modified().unwrap_or(UNIX_EPOCH) >= cutoff {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => deleted = deleted.saturating_add(1),
            Err(err) => {
                tracing::warn!(path = %path.display(), "log cleanup: remove failed: {}", err);
            }
        }
    }

    Ok(deleted)
}
