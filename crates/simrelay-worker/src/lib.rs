//! Worker supervision and result relay for simrelay.
//!
//! This crate runs a single simulation worker process at a time and relays
//! the JSON documents it prints to every interested subscriber.
//!
//! # Overview
//!
//! - Spawn the worker, hand it its run configuration on stdin, stop it on request
//! - Frame the worker's stdout into newline-delimited JSON fragments
//! - Publish each fragment to the status store and the topic bus, in order
//! - Accept start/stop commands and answer with acknowledgements
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │   CommandGateway     │ ◄─── │  control topic / HTTP│
//! │ (start, stop, status)│      └──────────────────────┘
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │  WorkerSupervisor    │ ───► │  worker process      │
//! │ (one run at a time)  │ ◄─── │  (stdout: NDJSON)    │
//! └──────────┬───────────┘      └──────────────────────┘
//!            │ LineFramer
//!            ▼
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │  ResultPublisher     │ ───► │  TopicBus / MQTT     │
//! │                      │ ───► │  StatusStore         │
//! └──────────────────────┘      └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use simrelay_core::RelayConfig;
//! use simrelay_worker::{Broker, CommandGateway, TopicBus, WorkerSupervisor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RelayConfig::default();
//!     let bus = TopicBus::new(config.bus.capacity);
//!     let mut results = bus.subscribe(&config.bus.results_topic);
//!
//!     let supervisor = WorkerSupervisor::new(&config, Arc::new(bus.clone()));
//!     let gateway = CommandGateway::new(Arc::new(supervisor));
//!
//!     let ack = gateway.request_start(serde_json::json!({"days": 7})).await;
//!     println!("accepted: {}", ack.accepted);
//!
//!     while let Some(message) = results.recv().await {
//!         println!("{}", message.payload);
//!     }
//! }
//! ```
//!
//! # Worker Protocol
//!
//! The worker:
//! 1. Reads one JSON object (the run configuration) from stdin, followed by EOF
//! 2. Writes one JSON document per line to stdout
//! 3. May write diagnostics to stderr; they are logged, never relayed
//! 4. Exits; a non-zero exit code is reported, not treated as a relay error

pub mod artifact;
pub mod bus;
pub mod framer;
pub mod gateway;
pub mod mqtt;
pub mod publisher;
pub mod status;
pub mod supervisor;
pub mod types;


// Re-export main types for convenience
pub use bus::{Broker, BusMessage, Subscription, TopicBus, topic_matches};
pub use framer::{FrameStats, LineFramer, frame_reader};
pub use gateway::{CommandGateway, spawn_control_listener};
pub use mqtt::MqttBroker;
pub use publisher::{ResultPublisher, RunPublisher};
pub use status::StatusStore;
pub use supervisor::WorkerSupervisor;
pub use types::{ExitOutcome, RunHandle};
