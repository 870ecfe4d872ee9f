// pb-test-utils: Shared test utilities for the parameter-bus suite.
//
// Provides a mock device (the WebSocket server side a hub session connects
// to) and a mock protocol client (for driving the hub's own server).

pub mod mock_client;
pub mod mock_device;

pub use mock_client::MockClient;
pub use mock_device::{MockDevice, MockDeviceSpec, MockParam};

#[cfg(test)]
mod tests {
    use super::*;
    use pb_protocol::{ParamValue, Request};

    fn lamp_device() -> MockDeviceSpec {
        let mut spec = MockDeviceSpec::new();
        spec.add_component(
            "Lamp",
            vec![
                MockParam::int("brightness", 7, 1, 1, 0, 100, ParamValue::Int(10)),
                MockParam::bool("on", 8, 1, 1, ParamValue::Bool(false)),
            ],
        );
        spec
    }

    #[tokio::test]
    async fn mock_device_serves_discovery_and_subscribe() {
        let device = MockDevice::start(lamp_device()).await.unwrap();
        let url = format!("ws://{}/ws", device.local_addr());
        let mut client = MockClient::connect(&url).await.unwrap();

        let components = client.request(&Request::GetComponents {}).await.unwrap();
        assert_eq!(components["components"][0]["name"], "Lamp");

        let count = client
            .request(&Request::GetParamInfo {
                comp: "Lamp".to_owned(),
                param_type: "int".to_owned(),
                idx: -1,
            })
            .await
            .unwrap();
        assert_eq!(count["count"], 1);

        let info = client
            .request(&Request::GetParamInfo {
                comp: "Lamp".to_owned(),
                param_type: "int".to_owned(),
                idx: 0,
            })
            .await
            .unwrap();
        assert_eq!(info["name"], "brightness");
        assert_eq!(info["param_id"], 7);

        let sub = client
            .request(&Request::Subscribe { param_id: 7, row: 0, col: 0 })
            .await
            .unwrap();
        assert_eq!(sub["value"], 10);
    }

    #[tokio::test]
    async fn mock_device_records_set_frames_and_pushes_updates() {
        let device = MockDevice::start(lamp_device()).await.unwrap();
        let url = format!("ws://{}/ws", device.local_addr());
        let mut client = MockClient::connect(&url).await.unwrap();

        client
            .send_json(&serde_json::json!({
                "type": "SET", "param_id": 7, "row": 0, "col": 0, "value": 42
            }))
            .await
            .unwrap();

        // The device pushes a param_update after applying the SET.
        let push = client.next_push().await.unwrap();
        assert_eq!(push["param_id"], 7);
        assert_eq!(push["value"], 42);

        let sets = device.received_sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0]["param_id"], 7);
    }
}
