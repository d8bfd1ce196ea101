//! End-to-end tests through the command gateway and the control topic.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use simrelay_core::{Acknowledgement, RelayConfig, RunState, WorkerConfig};
use simrelay_worker::{
    Broker, BusMessage, CommandGateway, Subscription, TopicBus, WorkerSupervisor,
    spawn_control_listener,
};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    bus: TopicBus,
    gateway: CommandGateway,
    results: Subscription,
    config: RelayConfig,
}

fn harness(script: &str) -> Harness {
    let config = RelayConfig {
        worker: WorkerConfig::new("sh").with_arg("-c").with_arg(script),
        ..RelayConfig::default()
    };
    let bus = TopicBus::new(config.bus.capacity);
    let results = bus.subscribe(&config.bus.results_topic);
    let supervisor = WorkerSupervisor::new(&config, Arc::new(bus.clone()));
    Harness {
        bus,
        gateway: CommandGateway::new(Arc::new(supervisor)),
        results,
        config,
    }
}

async fn next_payload(sub: &mut Subscription) -> Value {
    tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for message")
        .expect("bus closed")
        .payload
}

#[tokio::test]
async fn test_start_streams_results_and_completes() {
    let mut h = harness(r#"read cfg; printf '{"step":1}\n{"step":2}\n'"#);

    let ack = h.gateway.request_start(json!({"x": 1})).await;
    assert!(ack.accepted);
    assert_eq!(ack.run_id, Some(1));
    assert!(ack.reason.is_none());

    assert_eq!(next_payload(&mut h.results).await, json!({"step": 1}));
    assert_eq!(next_payload(&mut h.results).await, json!({"step": 2}));

    let state = h.gateway.supervisor().wait_for_terminal(WAIT).await.unwrap();
    assert_eq!(state, RunState::Completed { exit_code: 0 });

    let status = h.gateway.status();
    assert!(!status.running);
    assert_eq!(status.state, RunState::Completed { exit_code: 0 });
    assert_eq!(status.latest, Some(json!({"step": 2})));
}

#[tokio::test]
async fn test_second_start_rejected_while_running() {
    let h = harness("read cfg; sleep 2");

    let first = h.gateway.request_start(json!({})).await;
    let second = h.gateway.request_start(json!({})).await;

    assert!(first.accepted);
    assert_eq!(second, Acknowledgement::rejected("AlreadyRunning"));
    assert_eq!(h.gateway.status().run_id, first.run_id);

    let stop = h.gateway.request_stop();
    assert!(stop.accepted);
    assert_eq!(stop.run_id, first.run_id);

    h.gateway.supervisor().wait_for_terminal(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_stop_while_idle_rejected() {
    let h = harness("read cfg");

    let ack = h.gateway.request_stop();
    assert_eq!(ack, Acknowledgement::rejected("NotRunning"));
    assert_eq!(h.gateway.status().state, RunState::Idle);
}

#[tokio::test]
async fn test_status_serializes_for_clients() {
    let h = harness("read cfg");

    let value = serde_json::to_value(h.gateway.status()).unwrap();
    assert_eq!(value["running"], json!(false));
    assert_eq!(value["state"]["status"], json!("idle"));
}

#[tokio::test]
async fn test_control_topic_start_and_stop() {
    let mut h = harness(r#"read cfg; printf '%s\n' "$cfg"; exec sleep 30"#);
    let broker: Arc<dyn Broker> = Arc::new(h.bus.clone());
    let mut acks = h.bus.subscribe(&h.config.bus.ack_topic);
    let listener = spawn_control_listener(
        h.gateway.clone(),
        broker,
        &h.config.bus.control_topic,
        &h.config.bus.ack_topic,
    );

    h.bus
        .publish(BusMessage::new(
            &h.config.bus.control_topic,
            json!({"command": "start", "payload": {"days": 3}}),
        ))
        .unwrap();

    let ack: Acknowledgement = serde_json::from_value(next_payload(&mut acks).await).unwrap();
    assert!(ack.accepted);
    assert_eq!(next_payload(&mut h.results).await, json!({"days": 3}));

    // Undecodable messages are skipped without an acknowledgement
    h.bus
        .publish(BusMessage::new(&h.config.bus.control_topic, json!("reboot")))
        .unwrap();
    h.bus
        .publish(BusMessage::new(&h.config.bus.control_topic, json!({"command": "stop"})))
        .unwrap();

    let ack: Acknowledgement = serde_json::from_value(next_payload(&mut acks).await).unwrap();
    assert!(ack.accepted);

    let state = h.gateway.supervisor().wait_for_terminal(WAIT).await.unwrap();
    assert!(matches!(state, RunState::Failed { .. }));

    listener.abort();
}
