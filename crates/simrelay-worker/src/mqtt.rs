//! MQTT broker adapter.
//!
//! [`MqttBroker`] carries bus messages over an external MQTT broker so that
//! clients outside the process can follow results and send control commands.
//!
//! ## Behavior
//! - Payloads travel as JSON with QoS 0 and are never retained.
//! - `publish()` fails with `BrokerUnavailable` while the connection is down.
//! - Every filter passed to `subscribe()` is registered with the broker and
//!   registered again after each reconnect. Filters stay registered for the
//!   lifetime of the broker.
//! - Incoming publishes fan out to local subscriptions through an in-process
//!   [`TopicBus`], so lag handling matches the in-process bus.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use simrelay_core::{BusConfig, RelayError, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Broker, BusMessage, Subscription, TopicBus};

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Pause between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Broker backed by an MQTT connection.
///
/// The connection is driven by a background task that reconnects on its own;
/// dropping the broker stops it.
pub struct MqttBroker {
    client: AsyncClient,
    local: TopicBus,
    filters: Arc<Mutex<BTreeSet<String>>>,
    connected: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl MqttBroker {
    /// Connect to the broker named by `bus.url`, or `None` when it is unset.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &BusConfig) -> Result<Option<Self>> {
        let Some((host, port)) = config.broker_endpoint()? else {
            return Ok(None);
        };
        let client_id = format!("simrelay-{}", std::process::id());
        Ok(Some(Self::connect(&client_id, host, port, config.capacity)))
    }

    /// Start connecting to `host:port`.
    ///
    /// Returns immediately; publishes fail until the broker accepts the
    /// connection.
    pub fn connect(client_id: &str, host: impl Into<String>, port: u16, capacity: usize) -> Self {
        let host = host.into();
        let mut options = MqttOptions::new(client_id, host.clone(), port);
        options.set_keep_alive(KEEP_ALIVE);

        let (client, event_loop) = AsyncClient::new(options, capacity.max(1));
        let local = TopicBus::new(capacity);
        let filters = Arc::new(Mutex::new(BTreeSet::new()));
        let connected = Arc::new(AtomicBool::new(false));

        info!(%host, port, client_id, "connecting to MQTT broker");
        let event_loop = tokio::spawn(drive(
            event_loop,
            client.clone(),
            local.clone(),
            filters.clone(),
            connected.clone(),
        ));

        Self {
            client,
            local,
            filters,
            connected,
            event_loop,
        }
    }

    /// Returns true while the broker has acknowledged the connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

impl Broker for MqttBroker {
    fn publish(&self, message: BusMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(RelayError::broker_unavailable("not connected to the MQTT broker"));
        }
        let payload = serde_json::to_vec(&message.payload)
            .map_err(|e| RelayError::json_parse("encoding bus message", e))?;

        self.client
            .try_publish(message.topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| RelayError::broker_unavailable(format!("MQTT publish failed: {e}")))
    }

    fn subscribe(&self, filter: &str) -> Subscription {
        let subscription = self.local.subscribe(filter);

        // Registered before the connection check so a concurrent ConnAck sees it
        let added = self.filters.lock().insert(filter.to_string());
        if added && self.is_connected() {
            if let Err(e) = self.client.try_subscribe(filter, QoS::AtMostOnce) {
                warn!(filter, error = %e, "MQTT subscribe not sent, retrying on reconnect");
            }
        }
        subscription
    }
}

/// Poll the connection until the broker is dropped.
async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    local: TopicBus,
    filters: Arc<Mutex<BTreeSet<String>>>,
    connected: Arc<AtomicBool>,
) {
    let mut outage_reported = false;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                outage_reported = false;
                info!("connected to MQTT broker");

                let filters: Vec<String> = filters.lock().iter().cloned().collect();
                for filter in filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        warn!(%filter, error = %e, "MQTT subscribe not sent");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(message) = incoming_message(&publish) {
                    // The local fan-out bus is never disconnected
                    let _ = local.publish(message);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                warn!("MQTT broker closed the connection");
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if outage_reported {
                    debug!(error = %e, "MQTT broker still unreachable");
                } else {
                    warn!(error = %e, "MQTT broker unreachable, reconnecting");
                    outage_reported = true;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Decode an incoming publish. Payloads that are not JSON are skipped.
fn incoming_message(publish: &Publish) -> Option<BusMessage> {
    match serde_json::from_slice(&publish.payload) {
        Ok(payload) => Some(BusMessage::new(publish.topic.clone(), payload)),
        Err(e) => {
            warn!(topic = %publish.topic, error = %e, "ignoring non-JSON MQTT message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_incoming_json_becomes_bus_message() {
        let publish = Publish::new("simulation/control", QoS::AtMostOnce, br#"{"command":"stop"}"#.to_vec());
        let message = incoming_message(&publish).unwrap();
        assert_eq!(message.topic, "simulation/control");
        assert_eq!(message.payload, json!({"command": "stop"}));
    }

    #[test]
    fn test_incoming_non_json_is_skipped() {
        let publish = Publish::new("simulation/control", QoS::AtMostOnce, b"stop please".to_vec());
        assert!(incoming_message(&publish).is_none());

        let empty = Publish::new("simulation/control", QoS::AtMostOnce, Vec::new());
        assert!(incoming_message(&empty).is_none());
    }

    #[tokio::test]
    async fn test_from_config_without_url_is_none() {
        assert!(MqttBroker::from_config(&BusConfig::default()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_without_connection_is_unavailable() {
        // Nothing listens on port 1
        let broker = MqttBroker::connect("simrelay-test", "127.0.0.1", 1, 8);
        let subscription = broker.subscribe("simulation/control");
        assert_eq!(subscription.filter(), "simulation/control");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!broker.is_connected());

        let err = broker
            .publish(BusMessage::new("simulation/results", json!({"step": 1})))
            .unwrap_err();
        assert!(matches!(err, RelayError::BrokerUnavailable { .. }));
        assert_eq!(err.reason_code(), "BrokerUnavailable");
    }
}
