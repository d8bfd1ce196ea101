//! Result publishing: status store first, then the bus.

use std::sync::Arc;

use serde_json::Value;
use simrelay_core::{Fragment, RunId};
use tracing::{trace, warn};

use crate::bus::{Broker, BusMessage};
use crate::status::StatusStore;

/// Publishes worker fragments to the status store and the bus.
#[derive(Clone)]
pub struct ResultPublisher {
    topic: String,
    broker: Arc<dyn Broker>,
    store: StatusStore,
}

impl std::fmt::Debug for ResultPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultPublisher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl ResultPublisher {
    /// Create a publisher for `topic`.
    pub fn new(topic: impl Into<String>, broker: Arc<dyn Broker>, store: StatusStore) -> Self {
        Self {
            topic: topic.into(),
            broker,
            store,
        }
    }

    /// Topic fragments are published on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Start publishing for a run. Sequence numbers restart at 0.
    pub fn for_run(&self, run_id: RunId) -> RunPublisher {
        RunPublisher {
            publisher: self.clone(),
            run_id,
            next_seq: 0,
            broker_down: false,
        }
    }
}

/// Publisher bound to a single run.
///
/// Owned by exactly one task at a time, so fragments leave in the order they
/// are handed in.
#[derive(Debug)]
pub struct RunPublisher {
    publisher: ResultPublisher,
    run_id: RunId,
    next_seq: u64,
    broker_down: bool,
}

impl RunPublisher {
    /// Run this publisher belongs to.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Number of fragments published so far.
    pub fn published(&self) -> u64 {
        self.next_seq
    }

    /// Publish one fragment.
    ///
    /// The status store is always updated. If the broker is unavailable the
    /// fragment reaches the store only; this is logged once per outage.
    pub fn publish(&mut self, payload: Value) -> Fragment {
        let fragment = Fragment {
            run_id: self.run_id,
            seq: self.next_seq,
            payload,
        };
        self.next_seq += 1;

        if !self
            .publisher
            .store
            .set_latest(self.run_id, fragment.payload.clone())
        {
            trace!(run_id = self.run_id, "status store moved on to a newer run");
        }

        let message = BusMessage::new(&self.publisher.topic, fragment.payload.clone());
        match self.publisher.broker.publish(message) {
            Ok(()) => {
                if self.broker_down {
                    self.broker_down = false;
                    warn!(run_id = self.run_id, "broker available again, resuming publishing");
                }
            }
            Err(e) => {
                if !self.broker_down {
                    self.broker_down = true;
                    warn!(
                        run_id = self.run_id,
                        error = %e,
                        "broker unavailable, fragments go to status store only"
                    );
                }
            }
        }

        trace!(run_id = self.run_id, seq = fragment.seq, "fragment published");
        fragment
    }
}
