//! Logging infrastructure for simrelay.
//!
//! Structured logging using the `tracing` ecosystem:
//!
//! - JSON lines written to a daily rolling file `~/.simrelay/logs/simrelay.log`
//! - Compact human-readable output on stderr
//! - `RUST_LOG` overrides the default `simrelay=info` filter
//!
//! ## Example
//!
//! ```no_run
//! use simrelay_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("simrelay started");
//! tracing::debug!(run_id = 1, "spawning worker");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{RelayError, Result};

/// Guard that must be held to ensure log flushing on shutdown.
///
/// Keep this guard alive for the lifetime of the application.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the simrelay logging system.
///
/// # Arguments
///
/// * `log_dir` - Optional custom log directory. Defaults to `~/.simrelay/logs/`
/// * `verbose` - If true, sets log level to DEBUG. Otherwise uses INFO.
///
/// # Returns
///
/// A [`LogGuard`] that must be held for the application lifetime.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir).map_err(|e| RelayError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "simrelay.log");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "simrelay={default_level},simrelay_core={default_level},simrelay_worker={default_level}"
        ))
    });

    // JSON layer for file output
    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    // Human-readable layer for console output
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Get the simrelay home directory (`~/.simrelay`).
pub fn simrelay_home() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| RelayError::Internal {
        message: "home directory could not be determined".into(),
    })?;

    Ok(home.join(".simrelay"))
}

/// Get the default log directory path (`~/.simrelay/logs/`).
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(simrelay_home()?.join("logs"))
}

/// Log a run lifecycle event under the `simrelay::run` target.
///
/// # Example
///
/// ```ignore
/// log_run_event!(run_id, "spawned");
/// log_run_event!(run_id, "exited", exit_code = 0);
/// ```
#[macro_export]
macro_rules! log_run_event {
    ($run_id:expr, $event:expr) => {
        tracing::info!(
            target: "simrelay::run",
            run_id = $run_id,
            event = $event,
            "run event"
        )
    };
    ($run_id:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "simrelay::run",
            run_id = $run_id,
            event = $event,
            $($field)*,
            "run event"
        )
    };
}
