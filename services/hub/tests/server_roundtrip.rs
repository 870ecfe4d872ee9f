// Integration: the hub's protocol server over a real socket, driven by a
// protocol client: subscribe → set_param → param_update round trip,
// unsubscribe silence, and read-only rejection.

use hub::app::Hub;
use hub::config::HubConfig;
use hub::scheduler::Scheduler;
use pb_protocol::Request;
use pb_test_utils::MockClient;
use std::time::Duration;
use tokio::sync::watch;

async fn spawn_hub() -> (Hub, watch::Sender<bool>, String) {
    let hub = Hub::new(HubConfig { server_port: 0, ..HubConfig::default() });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = hub.start(shutdown_rx).await.unwrap();
    let url = format!("ws://127.0.0.1:{}/ws", addr.port());
    (hub, shutdown_tx, url)
}

async fn param_id_of(client: &mut MockClient, comp: &str, param: &str) -> u32 {
    let reply = client
        .request(&Request::GetComponentParams { comp: Some(comp.to_owned()), comp_id: None })
        .await
        .unwrap();
    reply["params"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == param)
        .unwrap_or_else(|| panic!("{comp}.{param} not advertised"))["param_id"]
        .as_u64()
        .unwrap() as u32
}

#[tokio::test]
async fn subscribe_set_update_roundtrip_and_unsubscribe_silence() {
    let (_hub, shutdown_tx, url) = spawn_hub().await;
    let mut client = MockClient::connect(&url).await.unwrap();

    let enabled_id = param_id_of(&mut client, Scheduler::COMPONENT, "enabled").await;

    // Subscribe returns the current value.
    let reply = client
        .request(&Request::Subscribe { param_id: enabled_id, row: 0, col: 0 })
        .await
        .unwrap();
    assert_eq!(reply["value"], true);

    // A write through the protocol comes back as a push frame.
    let reply = client
        .request(&Request::SetParam {
            param_id: Some(enabled_id),
            comp: None,
            param: None,
            param_type: None,
            idx: None,
            row: 0,
            col: 0,
            value: Some(pb_protocol::ParamValue::Bool(false)),
        })
        .await
        .unwrap();
    assert_eq!(reply["success"], true);

    let push = tokio::time::timeout(Duration::from_secs(1), client.next_push())
        .await
        .expect("param_update should arrive")
        .unwrap();
    assert_eq!(push["param_id"], u64::from(enabled_id));
    assert_eq!(push["value"], false);

    // After unsubscribe, further changes stay silent.
    let reply = client
        .request(&Request::Unsubscribe { param_id: enabled_id, row: 0, col: 0 })
        .await
        .unwrap();
    assert_eq!(reply["success"], true);

    let reply = client
        .request(&Request::SetParam {
            param_id: Some(enabled_id),
            comp: None,
            param: None,
            param_type: None,
            idx: None,
            row: 0,
            col: 0,
            value: Some(pb_protocol::ParamValue::Bool(true)),
        })
        .await
        .unwrap();
    assert_eq!(reply["success"], true);

    let silence = tokio::time::timeout(Duration::from_millis(300), client.next_push()).await;
    assert!(silence.is_err(), "unsubscribed client must receive no pushes");

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn read_only_rejection_and_get_param_over_the_wire() {
    let (hub, shutdown_tx, url) = spawn_hub().await;
    let mut client = MockClient::connect(&url).await.unwrap();

    // queue_length is read-only: the protocol refuses, the value holds.
    let reply = client
        .request(&Request::SetParam {
            param_id: None,
            comp: Some(Scheduler::COMPONENT.to_owned()),
            param: Some("queue_length".to_owned()),
            param_type: None,
            idx: None,
            row: 0,
            col: 0,
            value: Some(pb_protocol::ParamValue::Int(5)),
        })
        .await
        .unwrap();
    assert_eq!(reply["success"], false);
    assert_eq!(reply["error"], "parameter is read-only");

    let (_, queue_length) = hub
        .registry
        .find_by_name(Scheduler::COMPONENT, "queue_length")
        .unwrap();
    assert_eq!(
        queue_length.get(0, 0).unwrap(),
        pb_protocol::ParamValue::Int(0)
    );

    let get = client
        .request(&Request::GetParam {
            param_id: None,
            comp: Some(Scheduler::COMPONENT.to_owned()),
            param: Some("queue_length".to_owned()),
            param_type: None,
            idx: None,
            row: 0,
            col: 0,
        })
        .await
        .unwrap();
    assert_eq!(get["value"], 0);
    assert_eq!(get["type"], "int");

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn discovery_structurally_matches_bulk_params_listing() {
    let (_hub, shutdown_tx, url) = spawn_hub().await;
    let mut client = MockClient::connect(&url).await.unwrap();

    let components = client.request(&Request::GetComponents {}).await.unwrap();
    let names: Vec<String> = components["components"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap().to_owned())
        .collect();
    assert!(names.contains(&"Scheduler".to_owned()));
    assert!(names.contains(&"Watcher".to_owned()));
    assert!(names.contains(&"NetworkActions".to_owned()));
    assert!(names.contains(&"Server".to_owned()));

    for name in names {
        let bulk = client
            .request(&Request::GetComponentParams { comp: Some(name.clone()), comp_id: None })
            .await
            .unwrap();
        let bulk_params = bulk["params"].as_array().unwrap().clone();

        // Legacy one-at-a-time discovery must enumerate the same set.
        let mut discovered = 0usize;
        for param_type in ["int", "float", "bool", "str"] {
            let count = client
                .request(&Request::GetParamInfo {
                    comp: name.clone(),
                    param_type: param_type.to_owned(),
                    idx: -1,
                })
                .await
                .unwrap()["count"]
                .as_u64()
                .unwrap();
            for idx in 0..count {
                let info = client
                    .request(&Request::GetParamInfo {
                        comp: name.clone(),
                        param_type: param_type.to_owned(),
                        idx: i64::try_from(idx).unwrap(),
                    })
                    .await
                    .unwrap();
                assert!(
                    bulk_params
                        .iter()
                        .any(|p| p["param_id"] == info["param_id"] && p["name"] == info["name"]),
                    "param {info} missing from bulk listing of {name}"
                );
                discovered += 1;
            }
        }
        assert_eq!(discovered, bulk_params.len(), "component {name}");
    }

    let _ = shutdown_tx.send(true);
}
