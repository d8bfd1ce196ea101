//! Shared type definitions used across simrelay crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a supervised run. Assigned monotonically, starting at 1.
pub type RunId = u64;

/// The configuration document handed verbatim to the worker on stdin.
pub type RunConfig = serde_json::Map<String, Value>;

/// The supervisor's authoritative view of the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunState {
    /// No worker has been started since the process came up
    #[default]
    Idle,
    /// A worker is alive and producing output
    Running,
    /// A stop was requested; the worker has not exited yet
    Stopping,
    /// The worker exited on its own with a status code
    Completed { exit_code: i32 },
    /// The worker crashed, was killed, or was stopped by request
    Failed { reason: String },
}

impl RunState {
    /// Returns true if a worker process may be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Returns true if the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Returns true if a new run may be started from this state.
    pub fn accepts_start(&self) -> bool {
        !self.is_active()
    }

    /// Returns true for a clean `Completed { exit_code: 0 }`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { exit_code: 0 })
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Completed { exit_code } => write!(f, "completed({exit_code})"),
            Self::Failed { reason } => write!(f, "failed({reason})"),
        }
    }
}

/// One decoded JSON document emitted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Run that produced this fragment
    pub run_id: RunId,
    /// Position within the run, in emission order, starting at 0
    pub seq: u64,
    /// The decoded document
    pub payload: Value,
}

/// Point-in-time view of the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    /// Whether a worker process may currently be alive
    pub running: bool,
    /// Current run state
    pub state: RunState,
    /// Latest fragment payload of the current run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<Value>,
    /// Current (or most recent) run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// When the current run started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Number of fragments published in the current run
    pub fragments: u64,
    /// Most recent start failure, cleared by the next successful start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Caller-facing answer to a start or stop command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl Acknowledgement {
    /// An accepted command.
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
            run_id: None,
        }
    }

    /// A rejected command with a reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            run_id: None,
        }
    }

    /// Attach the run this acknowledgement refers to.
    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Command carried on the control topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Start,
    Stop,
}

/// Message carried on the control topic: `{"command": "start", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub command: ControlCommand,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_state_predicates() {
        assert!(RunState::Idle.accepts_start());
        assert!(!RunState::Running.accepts_start());
        assert!(!RunState::Stopping.accepts_start());
        assert!(RunState::Completed { exit_code: 3 }.accepts_start());
        assert!(RunState::Failed { reason: "boom".into() }.accepts_start());

        assert!(RunState::Completed { exit_code: 0 }.is_success());
        assert!(!RunState::Completed { exit_code: 1 }.is_success());
        assert!(!RunState::Stopping.is_terminal());
    }

    #[test]
    fn test_run_state_serialization() {
        let value = serde_json::to_value(RunState::Completed { exit_code: 0 }).unwrap();
        assert_eq!(value, json!({"status": "completed", "exit_code": 0}));

        let value = serde_json::to_value(RunState::Idle).unwrap();
        assert_eq!(value, json!({"status": "idle"}));
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Running.to_string(), "running");
        assert_eq!(
            RunState::Failed { reason: "terminated by signal 9".into() }.to_string(),
            "failed(terminated by signal 9)"
        );
    }

    #[test]
    fn test_acknowledgement_serialization() {
        let ack = Acknowledgement::rejected("AlreadyRunning");
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"accepted": false, "reason": "AlreadyRunning"})
        );

        let ack = Acknowledgement::accepted().with_run(4);
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"accepted": true, "run_id": 4})
        );
    }

    #[test]
    fn test_control_message_parse() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"command":"start","payload":{"x":1}}"#).unwrap();
        assert_eq!(msg.command, ControlCommand::Start);
        assert_eq!(msg.payload, Some(json!({"x": 1})));

        let msg: ControlMessage = serde_json::from_str(r#"{"command":"stop"}"#).unwrap();
        assert_eq!(msg.command, ControlCommand::Stop);
        assert!(msg.payload.is_none());

        assert!(serde_json::from_str::<ControlMessage>(r#"{"command":"pause"}"#).is_err());
    }
}
