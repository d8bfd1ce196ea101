//! Command gateway: the single entry point for start, stop and status.
//!
//! The gateway translates supervisor results into [`Acknowledgement`]s and
//! never looks at the run state itself. Transports (the HTTP adapter, the
//! control topic) sit on top of it.

use std::sync::Arc;

use serde_json::Value;
use simrelay_core::{Acknowledgement, ControlCommand, ControlMessage, RelayError, StatusSnapshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, BusMessage};
use crate::supervisor::WorkerSupervisor;

/// Reason given when a start request carries something other than a mapping.
pub const INVALID_CONFIG: &str = "InvalidConfig";

/// Start/stop/status front door for clients.
#[derive(Debug, Clone)]
pub struct CommandGateway {
    supervisor: Arc<WorkerSupervisor>,
}

impl CommandGateway {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Underlying supervisor.
    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Ask for a new run with `config`.
    pub async fn request_start(&self, config: Value) -> Acknowledgement {
        let Value::Object(config) = config else {
            debug!("start rejected: configuration is not an object");
            return Acknowledgement::rejected(INVALID_CONFIG);
        };

        match self.supervisor.start(config).await {
            Ok(handle) => Acknowledgement::accepted().with_run(handle.run_id),
            Err(e) => reject("start", &e),
        }
    }

    /// Ask the running worker to stop.
    pub fn request_stop(&self) -> Acknowledgement {
        match self.supervisor.stop() {
            Ok(()) => {
                let mut ack = Acknowledgement::accepted();
                ack.run_id = self.supervisor.status().run_id;
                ack
            }
            Err(e) => reject("stop", &e),
        }
    }

    /// Current status.
    pub fn status(&self) -> StatusSnapshot {
        self.supervisor.status()
    }

    /// Dispatch a decoded control message.
    pub async fn handle(&self, message: ControlMessage) -> Acknowledgement {
        match message.command {
            ControlCommand::Start => {
                let config = message
                    .payload
                    .unwrap_or_else(|| Value::Object(Default::default()));
                self.request_start(config).await
            }
            ControlCommand::Stop => self.request_stop(),
        }
    }
}

fn reject(command: &str, err: &RelayError) -> Acknowledgement {
    if err.is_rejection() {
        debug!(command, reason = err.reason_code(), "command rejected");
    } else if err.is_recoverable() {
        warn!(command, error = %err, "command failed");
    } else {
        error!(command, error = %err, guidance = ?err.guidance(), "command failed");
    }
    Acknowledgement::rejected(err.reason_code())
}

/// Serve start/stop requests arriving on `control_topic`.
///
/// Each acknowledgement is published on `ack_topic`. Messages that do not
/// decode as a control message are logged and skipped. The task ends when the
/// bus goes away.
pub fn spawn_control_listener(
    gateway: CommandGateway,
    broker: Arc<dyn Broker>,
    control_topic: &str,
    ack_topic: &str,
) -> JoinHandle<()> {
    let mut subscription = broker.subscribe(control_topic);
    let ack_topic = ack_topic.to_string();

    tokio::spawn(async move {
        info!(topic = %subscription.filter(), "control listener started");

        while let Some(message) = subscription.recv().await {
            let control: ControlMessage = match serde_json::from_value(message.payload) {
                Ok(control) => control,
                Err(e) => {
                    warn!(topic = %message.topic, error = %e, "ignoring undecodable control message");
                    continue;
                }
            };

            let command = control.command;
            let ack = gateway.handle(control).await;
            debug!(?command, accepted = ack.accepted, "control command handled");

            let payload = match serde_json::to_value(&ack) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "failed to encode acknowledgement");
                    continue;
                }
            };
            if let Err(e) = broker.publish(BusMessage::new(&ack_topic, payload)) {
                warn!(topic = %ack_topic, error = %e, "acknowledgement not delivered");
            }
        }

        debug!("control listener stopped");
    })
}
