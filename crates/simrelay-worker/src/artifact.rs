//! Final result artifact written by the worker.
//!
//! Some workers write a larger summary document to disk as they finish. After
//! exit the supervisor waits a short settling delay, then reads the file once
//! under a timeout. A file left over from an earlier run is ignored.

use std::path::Path;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use simrelay_core::{ArtifactConfig, RelayError, Result};
use tokio::time::timeout;
use tracing::debug;

/// Slack allowed between the run start and the artifact's modification time,
/// for filesystems with coarse timestamps.
const MTIME_SLACK: Duration = Duration::from_secs(1);

/// Wait for the artifact to settle, then read and decode it.
///
/// Returns `Ok(None)` when no artifact path is configured.
pub async fn collect(config: &ArtifactConfig, run_started: SystemTime) -> Result<Option<Value>> {
    let Some(path) = config.path.as_deref() else {
        return Ok(None);
    };

    tokio::time::sleep(config.settle_delay()).await;

    let contents = match timeout(config.read_timeout(), read_fresh(path, run_started)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!(path = %path.display(), "artifact read timed out");
            return Err(RelayError::ArtifactNotFound { path: path.into() });
        }
    };

    parse_artifact(&contents).map(Some)
}

/// Read the artifact if it was written during the current run.
async fn read_fresh(path: &Path, run_started: SystemTime) -> Result<String> {
    let not_found = || RelayError::ArtifactNotFound { path: path.into() };

    let metadata = tokio::fs::metadata(path).await.map_err(|_| not_found())?;
    if let Ok(modified) = metadata.modified() {
        let threshold = run_started.checked_sub(MTIME_SLACK).unwrap_or(run_started);
        if modified < threshold {
            debug!(path = %path.display(), "artifact predates run, ignoring");
            return Err(not_found());
        }
    }

    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RelayError::io("reading result artifact", path, e))
}

/// Decode an artifact.
///
/// A JSON array is taken as-is. Anything else is treated as a bare
/// comma-separated list of documents and wrapped in `[` `]` first; a trailing
/// comma is tolerated.
pub fn parse_artifact(contents: &str) -> Result<Value> {
    let trimmed = contents.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| RelayError::json_parse("result artifact", e));
    }

    let body = trimmed.trim_end_matches(|c: char| c == ',' || c.is_whitespace());
    serde_json::from_str(&format!("[{body}]")).map_err(|e| RelayError::json_parse("result artifact", e))
}
