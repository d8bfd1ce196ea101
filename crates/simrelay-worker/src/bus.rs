//! Topic-based publish/subscribe bus.
//!
//! [`Broker`] is the seam between the relay and whatever carries messages to
//! clients. [`TopicBus`] is the in-process implementation: one
//! [`tokio::sync::broadcast`] ring shared by every subscription, with topic
//! filtering on the receiving side.
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never waits for subscribers.
//! - **Bounded capacity**: the ring keeps the most recent `capacity` messages.
//! - **Lag handling**: a slow subscription skips the messages it missed and
//!   keeps going; publishers are never stalled by it.
//! - **No persistence**: messages published with no subscribers are dropped.
//!
//! ## Topic filters
//! Topics are `/`-separated levels. Filters follow MQTT conventions:
//! `+` matches exactly one level, a trailing `#` matches any remaining levels
//! (including none).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use simrelay_core::{RelayError, Result};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Message body
    pub payload: Value,
}

impl BusMessage {
    /// Create a message for a topic.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Publish/subscribe broker seen by the relay.
pub trait Broker: Send + Sync {
    /// Hand a message to the broker without waiting for delivery.
    ///
    /// Returns `BrokerUnavailable` when the broker cannot accept messages.
    fn publish(&self, message: BusMessage) -> Result<()>;

    /// Subscribe to every topic matching `filter`.
    fn subscribe(&self, filter: &str) -> Subscription;
}

/// Returns true if `topic` matches the MQTT-style `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-process topic bus.
///
/// Cheap to clone; clones share the same ring and connection flag.
#[derive(Debug, Clone)]
pub struct TopicBus {
    tx: broadcast::Sender<BusMessage>,
    connected: Arc<AtomicBool>,
}

impl TopicBus {
    /// Create a bus whose ring holds `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing the broker connection; publishes fail until reconnect.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("bus disconnected");
        }
    }

    /// Restore the broker connection.
    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            debug!("bus reconnected");
        }
    }

    /// Returns true while the bus accepts messages.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Broker for TopicBus {
    fn publish(&self, message: BusMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(RelayError::broker_unavailable("in-process bus is disconnected"));
        }
        // No receivers is not an error: the message is simply dropped.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Subscription {
        Subscription {
            filter: filter.to_string(),
            rx: self.tx.subscribe(),
            skipped: 0,
        }
    }
}

/// A live subscription to a topic filter.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: broadcast::Receiver<BusMessage>,
    skipped: u64,
}

impl Subscription {
    /// The filter this subscription was created with.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Messages this subscription missed because it fell behind.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Wait for the next message matching the filter.
    ///
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if topic_matches(&self.filter, &message.topic) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.skipped += n;
                    warn!(filter = %self.filter, skipped = n, "subscriber lagged, messages skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next matching message if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) if topic_matches(&self.filter, &message.topic) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.skipped += n;
                }
                Err(_) => return None,
            }
        }
    }
}
