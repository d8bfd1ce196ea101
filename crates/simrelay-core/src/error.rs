//! Error types for simrelay operations.
//!
//! This module defines [`RelayError`], the single error enum shared by every
//! simrelay crate. Command rejections (`AlreadyRunning`, `NotRunning`) are
//! ordinary values that callers turn into acknowledgements; they are never
//! fatal to the process.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error type for all simrelay operations.
///
/// - No automatic retry: a failed run is retried only by a new start request
/// - No silent failures: every error is either returned or logged
#[derive(Debug, Error)]
pub enum RelayError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Parsing Errors
    // =========================================================================
    /// JSON parsing error
    #[error("JSON parse error in {context}: {message}")]
    JsonParse {
        context: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// A worker output line that is not a JSON document (non-fatal, discarded)
    #[error("Malformed output line: {message}")]
    MalformedOutputLine { line: String, message: String },

    // =========================================================================
    // Run Lifecycle Errors
    // =========================================================================
    /// A worker is already running or stopping
    #[error("A simulation is already running")]
    AlreadyRunning,

    /// No worker is running
    #[error("No simulation is running")]
    NotRunning,

    /// The worker process could not be spawned
    #[error("Failed to spawn worker {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing the run configuration to the worker failed
    #[error("Failed to send configuration to worker: {message}")]
    WorkerInput { message: String },

    /// The worker did not exit within the allotted time
    #[error("Worker did not exit within {timeout_ms}ms")]
    ExitTimeout { timeout_ms: u64 },

    // =========================================================================
    // Relay Errors
    // =========================================================================
    /// The publish/subscribe broker is not reachable
    #[error("Broker unavailable: {message}")]
    BrokerUnavailable { message: String },

    /// The final result artifact was missing, stale or unreadable
    #[error("Result artifact not found: {path}")]
    ArtifactNotFound { path: PathBuf },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in simrelay)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a ConfigNotFound error with source
    pub fn config_not_found_with_source(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValidation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON parse error
    pub fn json_parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            context: context.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a malformed output line error
    pub fn malformed_line(line: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedOutputLine {
            line: line.into(),
            message: message.into(),
        }
    }

    /// Create a spawn error
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Create a broker unavailable error
    pub fn broker_unavailable(message: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if this error rejects a command without changing any state.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::NotRunning)
    }

    /// Returns true if this error is recoverable locally (processing continues)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedOutputLine { .. }
                | Self::BrokerUnavailable { .. }
                | Self::ArtifactNotFound { .. }
                | Self::WorkerInput { .. }
                | Self::ExitTimeout { .. }
        )
    }

    /// Short machine-readable kind, used as the `reason` of a rejected command.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "ConfigNotFound",
            Self::ConfigInvalid { .. } => "ConfigInvalid",
            Self::ConfigValidation { .. } => "ConfigValidation",
            Self::Io { .. } => "Io",
            Self::DirectoryCreation { .. } => "DirectoryCreation",
            Self::JsonParse { .. } => "JsonParse",
            Self::MalformedOutputLine { .. } => "MalformedOutputLine",
            Self::AlreadyRunning => "AlreadyRunning",
            Self::NotRunning => "NotRunning",
            Self::Spawn { .. } => "SpawnError",
            Self::WorkerInput { .. } => "WorkerInput",
            Self::ExitTimeout { .. } => "ExitTimeout",
            Self::BrokerUnavailable { .. } => "BrokerUnavailable",
            Self::ArtifactNotFound { .. } => "ArtifactNotFound",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Create ~/.simrelay/config.yaml or pass --config <path>")
            }
            Self::ConfigInvalid { .. } => Some("Check YAML syntax of the configuration file"),
            Self::AlreadyRunning => Some("Stop the current simulation or wait for it to finish"),
            Self::NotRunning => Some("Start a simulation first"),
            Self::Spawn { .. } => {
                Some("Check worker.program and worker.working_dir in the configuration")
            }
            Self::BrokerUnavailable { .. } => {
                Some("Check bus.url and that the message broker is reachable")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_not_found_error() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = RelayError::config_not_found_with_source("/home/user/.simrelay/config.yaml", source);
        assert!(err.to_string().contains("Configuration not found"));
        assert!(!err.is_rejection());
        assert!(!err.is_recoverable());
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_rejection_reason_codes() {
        assert!(RelayError::AlreadyRunning.is_rejection());
        assert!(RelayError::NotRunning.is_rejection());
        assert_eq!(RelayError::AlreadyRunning.reason_code(), "AlreadyRunning");
        assert_eq!(RelayError::NotRunning.reason_code(), "NotRunning");
    }

    #[test]
    fn test_spawn_error() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = RelayError::spawn("python3", source);
        assert!(err.to_string().contains("python3"));
        assert_eq!(err.reason_code(), "SpawnError");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_classification() {
        assert!(RelayError::malformed_line("not-json", "expected value").is_recoverable());
        assert!(RelayError::broker_unavailable("disconnected").is_recoverable());
        assert!(!RelayError::internal("bug").is_recoverable());
    }
}
