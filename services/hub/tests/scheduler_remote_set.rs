// Integration: nicknames resolve through the scheduler's cell, and a
// queued remote action lands on the device session as a SET frame.

use hub::app::Hub;
use hub::config::HubConfig;
use hub::scheduler::Scheduler;
use pb_protocol::ParamValue;
use pb_test_utils::{MockDevice, MockDeviceSpec, MockParam};
use std::time::Duration;
use tokio::sync::watch;

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn nicknamed_action_sends_set_frame_to_the_device() {
    let mut spec = MockDeviceSpec::new();
    spec.add_component(
        "Lamp",
        vec![MockParam::int("brightness", 7, 1, 1, 0, 100, ParamValue::Int(10))],
    );
    let device = MockDevice::start(spec).await.unwrap();
    let endpoint = device.local_addr().to_string();

    let hub = Hub::new(HubConfig {
        devices: vec![endpoint.clone()],
        server_port: 0,
        discovery_delay: Duration::from_millis(1),
        subscribe_delay: Duration::from_millis(1),
        request_timeout: Duration::from_secs(2),
        ..HubConfig::default()
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    hub.start(shutdown_rx).await.unwrap();

    let handle = hub.devices.get(&endpoint).unwrap();
    wait_for("session to reach LISTENING", || handle.is_listening()).await;

    // Bind the nickname through the scheduler's cell (the single mutation
    // path for the shared map).
    let (_, nicknames_cell) = hub
        .registry
        .find_by_name(Scheduler::COMPONENT, "device_nicknames")
        .unwrap();
    nicknames_cell
        .set(
            0,
            0,
            ParamValue::Str(format!(r#"{{"kitchen": "{endpoint}"}}"#)),
            true,
        )
        .unwrap();

    // Queue the action against the nickname.
    let (_, action_cell) = hub
        .registry
        .find_by_name(Scheduler::COMPONENT, "action_to_send")
        .unwrap();
    action_cell
        .set(
            0,
            0,
            ParamValue::Str(
                r#"{"actions": [{"device": "kitchen", "param_id": 7,
                    "row": 0, "col": 0, "value": 42, "wait_after_ms": 0}]}"#
                    .to_owned(),
            ),
            true,
        )
        .unwrap();

    // The SET frame reaches the session for the resolved endpoint within
    // the 200 ms budget.
    tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            let sets = device.received_sets();
            if !sets.is_empty() {
                assert_eq!(sets[0]["type"], "SET");
                assert_eq!(sets[0]["param_id"], 7);
                assert_eq!(sets[0]["row"], 0);
                assert_eq!(sets[0]["col"], 0);
                assert_eq!(sets[0]["value"], 42);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("SET frame should arrive within 200ms");

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn remote_write_to_offline_device_is_dropped_not_queued() {
    let hub = Hub::new(HubConfig {
        server_port: 0,
        ..HubConfig::default()
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    hub.start(shutdown_rx).await.unwrap();

    // A device handle that never connects.
    let handle = hub.devices.insert("10.9.9.9");

    let (_, action_cell) = hub
        .registry
        .find_by_name(Scheduler::COMPONENT, "action_to_send")
        .unwrap();
    action_cell
        .set(
            0,
            0,
            ParamValue::Str(
                r#"{"actions": [{"device": "10.9.9.9", "param_id": 1,
                    "value": 5, "wait_after_ms": 0}]}"#
                    .to_owned(),
            ),
            true,
        )
        .unwrap();

    // The action drains from the queue (dropped with a warning) rather
    // than lingering for a later reconnect.
    wait_for("queue to drain", || hub.scheduler.queue_len() == 0).await;
    assert!(!handle.is_listening());

    let _ = shutdown_tx.send(true);
}
