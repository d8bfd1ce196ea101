//! Worker run types.
//!
//! This module defines the handle returned for a started run and the way a
//! worker's exit is classified into a terminal [`RunState`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simrelay_core::{RunId, RunState};

/// Reason recorded when a stopped worker does not exit cleanly.
pub const STOPPED_BY_REQUEST: &str = "stopped by request";

/// Handle to a started run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    /// Run identifier, unique for the lifetime of the supervisor
    pub run_id: RunId,
    /// Process ID of the worker, if the platform reported one
    pub pid: Option<u32>,
    /// When the worker was spawned
    pub started_at: DateTime<Utc>,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal
    Signal(i32),
    /// Waiting for the process failed
    WaitError(String),
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }

        Self::WaitError(format!("worker ended without a status: {status}"))
    }
}

impl ExitOutcome {
    /// Terminal run state for this outcome.
    ///
    /// After a stop request only a clean `0` counts as completed; anything
    /// else is recorded as stopped.
    pub fn terminal_state(&self, stop_requested: bool) -> RunState {
        match (self, stop_requested) {
            (Self::Code(0), true) => RunState::Completed { exit_code: 0 },
            (_, true) => RunState::Failed {
                reason: STOPPED_BY_REQUEST.to_string(),
            },
            (Self::Code(code), false) => RunState::Completed { exit_code: *code },
            (Self::Signal(signal), false) => RunState::Failed {
                reason: format!("terminated by signal {signal}"),
            },
            (Self::WaitError(message), false) => RunState::Failed {
                reason: message.clone(),
            },
        }
    }

    /// Exit code, if the worker exited with one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            _ => None,
        }
    }
}

/// Signal sent to the exit observer of a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    /// Polite termination (SIGTERM on Unix)
    Terminate,
    /// Forced kill
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrequested_exit_states() {
        assert_eq!(
            ExitOutcome::Code(0).terminal_state(false),
            RunState::Completed { exit_code: 0 }
        );
        assert_eq!(
            ExitOutcome::Code(2).terminal_state(false),
            RunState::Completed { exit_code: 2 }
        );
        assert_eq!(
            ExitOutcome::Signal(9).terminal_state(false),
            RunState::Failed {
                reason: "terminated by signal 9".into()
            }
        );
    }

    #[test]
    fn test_requested_stop_states() {
        assert_eq!(
            ExitOutcome::Code(0).terminal_state(true),
            RunState::Completed { exit_code: 0 }
        );
        assert_eq!(
            ExitOutcome::Signal(15).terminal_state(true),
            RunState::Failed {
                reason: STOPPED_BY_REQUEST.into()
            }
        );
        assert_eq!(
            ExitOutcome::Code(143).terminal_state(true),
            RunState::Failed {
                reason: STOPPED_BY_REQUEST.into()
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_outcome_from_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let status = std::process::ExitStatus::from_raw(3 << 8);
        assert_eq!(ExitOutcome::from(status), ExitOutcome::Code(3));

        let status = std::process::ExitStatus::from_raw(15);
        assert_eq!(ExitOutcome::from(status), ExitOutcome::Signal(15));
        assert_eq!(ExitOutcome::Signal(15).code(), None);
    }
}
