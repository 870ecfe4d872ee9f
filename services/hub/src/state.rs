//! Shared hub state: the device table, per-device handles with their shadow
//! component trees, and the nickname map.
//!
//! Ownership: the hub owns the registry and device table; engines hold
//! `Arc` handles for lookup only.  Each device-session task is the sole
//! writer of its device's shadow and mirror.

use crate::mirror::Mirror;
use pb_protocol::{ParamInfo, ParamValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

// ---------------------------------------------------------------------------
// Nicknames
// ---------------------------------------------------------------------------

/// Shared nickname → IP map.
///
/// Single writer: the scheduler's `device_nicknames` cell callback.  The
/// watcher and the network-actions engine hold read-only clones.
#[derive(Debug, Clone, Default)]
pub struct Nicknames {
    map: Arc<RwLock<HashMap<String, String>>>,
}

impl Nicknames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an identifier: a known nickname maps to its IP, anything
    /// else passes through unchanged.
    pub fn resolve(&self, host: &str) -> String {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
            .unwrap_or_else(|| host.to_owned())
    }

    /// Replace the whole map (called when the nicknames cell changes).
    pub fn replace(&self, map: HashMap<String, String>) {
        *self.map.write().unwrap_or_else(PoisonError::into_inner) = map;
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Device shadow
// ---------------------------------------------------------------------------

/// One remote component as advertised at discovery time.
#[derive(Debug, Clone)]
pub struct ShadowComponent {
    pub name: String,
    /// Parameters in discovery order.
    pub params: Vec<ParamInfo>,
}

/// State for one remote device endpoint.
///
/// The session task is the only writer of `shadow` and `mirror`; other
/// tasks read them and may enqueue outbound frames through the outbox.
pub struct DeviceHandle {
    /// Endpoint as configured, `IP` or `IP:PORT`.
    pub endpoint: String,
    connected: AtomicBool,
    shadow: RwLock<Vec<ShadowComponent>>,
    pub mirror: Mirror,
    /// Present only while the session is in its LISTENING state.
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("device {0} is not connected")]
    NotConnected(String),
}

impl DeviceHandle {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            connected: AtomicBool::new(false),
            shadow: RwLock::new(Vec::new()),
            mirror: Mirror::new(),
            outbox: Mutex::new(None),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Install the outbox when the session reaches LISTENING; `None` on the
    /// way out.
    pub fn set_outbox(&self, outbox: Option<mpsc::UnboundedSender<Message>>) {
        *self.outbox.lock().unwrap_or_else(PoisonError::into_inner) = outbox;
    }

    /// True while the session is in its LISTENING state and outbound
    /// writes will actually be sent.
    pub fn is_listening(&self) -> bool {
        self.connected()
            && self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    /// Send a fire-and-forget `SET` frame on the live session.
    ///
    /// There is no queueing across reconnects: a write while the session is
    /// not LISTENING fails, and the caller logs and drops it.
    pub fn send_set(
        &self,
        param_id: u32,
        row: u16,
        col: u16,
        value: &ParamValue,
    ) -> Result<(), SendError> {
        let frame = serde_json::json!({
            "type": "SET",
            "param_id": param_id,
            "row": row,
            "col": col,
            "value": value,
        });
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        match outbox.as_ref() {
            Some(tx) if self.connected() => tx
                .send(Message::Text(frame.to_string().into()))
                .map_err(|_| SendError::NotConnected(self.endpoint.clone())),
            _ => Err(SendError::NotConnected(self.endpoint.clone())),
        }
    }

    // -- shadow maintenance (session task only) --

    /// Drop the previous shadow and mirror at the start of a rediscovery.
    pub fn begin_discovery(&self) {
        self.shadow
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.mirror.clear();
    }

    pub fn add_shadow_component(&self, name: &str) {
        self.shadow
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ShadowComponent { name: name.to_owned(), params: Vec::new() });
    }

    pub fn add_shadow_param(&self, component: &str, info: ParamInfo) {
        let mut shadow = self.shadow.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(comp) = shadow.iter_mut().find(|c| c.name == component) {
            comp.params.push(info);
        } else {
            debug!(endpoint = %self.endpoint, component, "shadow component missing for param");
        }
    }

    // -- shadow lookup --

    /// Components and parameters in discovery order.
    pub fn shadow_snapshot(&self) -> Vec<ShadowComponent> {
        self.shadow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn find_param_by_id(&self, param_id: u32) -> Option<(String, ParamInfo)> {
        let shadow = self.shadow.read().unwrap_or_else(PoisonError::into_inner);
        for comp in shadow.iter() {
            if let Some(info) = comp.params.iter().find(|p| p.param_id == param_id) {
                return Some((comp.name.clone(), info.clone()));
            }
        }
        None
    }

    pub fn param_id_by_name(&self, component: &str, param: &str) -> Option<u32> {
        let shadow = self.shadow.read().unwrap_or_else(PoisonError::into_inner);
        shadow
            .iter()
            .find(|c| c.name == component)?
            .params
            .iter()
            .find(|p| p.name == param)
            .map(|p| p.param_id)
    }
}

// ---------------------------------------------------------------------------
// Device table
// ---------------------------------------------------------------------------

/// All remote devices, keyed by configured endpoint.
#[derive(Default)]
pub struct DeviceTable {
    devices: RwLock<HashMap<String, Arc<DeviceHandle>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, endpoint: &str) -> Arc<DeviceHandle> {
        let handle = Arc::new(DeviceHandle::new(endpoint));
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_owned(), handle.clone());
        handle
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<DeviceHandle>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<DeviceHandle>> {
        let mut all: Vec<_> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    /// Full state snapshot: per device, the connected flag and every
    /// mirrored cell value.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut devices = serde_json::Map::new();
        for device in self.all() {
            let mut components = serde_json::Map::new();
            for comp in device.shadow_snapshot() {
                let mut params = serde_json::Map::new();
                for info in &comp.params {
                    let mut cells = serde_json::Map::new();
                    for row in 0..info.rows {
                        for col in 0..info.cols {
                            let key = Mirror::named_key(&comp.name, &info.name, row, col);
                            if let Some(value) = device.mirror.get(&key) {
                                cells.insert(
                                    format!("{row},{col}"),
                                    serde_json::to_value(value).unwrap_or_default(),
                                );
                            }
                        }
                    }
                    params.insert(
                        info.name.clone(),
                        serde_json::json!({
                            "type": info.param_type,
                            "read_only": info.read_only,
                            "values": cells,
                        }),
                    );
                }
                components.insert(comp.name.clone(), serde_json::Value::Object(params));
            }
            devices.insert(
                device.endpoint.clone(),
                serde_json::json!({
                    "connected": device.connected(),
                    "components": components,
                }),
            );
        }
        serde_json::Value::Object(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_protocol::ParamType;

    fn info(name: &str, param_id: u32, rows: u16, cols: u16) -> ParamInfo {
        ParamInfo {
            name: name.to_owned(),
            param_id,
            param_type: Some(ParamType::Int),
            rows,
            cols,
            read_only: false,
            min: Some(ParamValue::Int(0)),
            max: Some(ParamValue::Int(100)),
        }
    }

    #[test]
    fn nicknames_resolve_known_and_pass_through_unknown() {
        let nicknames = Nicknames::new();
        nicknames.replace(HashMap::from([("kitchen".to_owned(), "10.0.0.46".to_owned())]));
        assert_eq!(nicknames.resolve("kitchen"), "10.0.0.46");
        assert_eq!(nicknames.resolve("10.0.0.9"), "10.0.0.9");
    }

    #[test]
    fn shadow_lookup_by_id_and_name() {
        let device = DeviceHandle::new("10.0.0.46");
        device.add_shadow_component("Lamp");
        device.add_shadow_param("Lamp", info("brightness", 7, 1, 1));
        device.add_shadow_param("Lamp", info("warmth", 8, 1, 1));

        let (comp, found) = device.find_param_by_id(8).unwrap();
        assert_eq!(comp, "Lamp");
        assert_eq!(found.name, "warmth");

        assert_eq!(device.param_id_by_name("Lamp", "brightness"), Some(7));
        assert_eq!(device.param_id_by_name("Lamp", "dimmer"), None);
        assert!(device.find_param_by_id(99).is_none());
    }

    #[test]
    fn begin_discovery_drops_shadow_and_mirror() {
        let device = DeviceHandle::new("10.0.0.46");
        device.add_shadow_component("Lamp");
        device.add_shadow_param("Lamp", info("brightness", 7, 1, 1));
        device.mirror.apply("Lamp", "brightness", 7, 0, 0, ParamValue::Int(3));

        device.begin_discovery();
        assert!(device.shadow_snapshot().is_empty());
        assert!(device.mirror.is_empty());
    }

    #[test]
    fn send_set_fails_without_live_outbox() {
        let device = DeviceHandle::new("10.0.0.46");
        let err = device.send_set(7, 0, 0, &ParamValue::Int(1)).unwrap_err();
        assert!(matches!(err, SendError::NotConnected(_)));

        // Connected flag alone is not enough; the outbox gates LISTENING.
        device.set_connected(true);
        assert!(device.send_set(7, 0, 0, &ParamValue::Int(1)).is_err());
    }

    #[test]
    fn snapshot_reports_connected_flag_and_mirrored_cells() {
        let table = DeviceTable::new();
        let device = table.insert("10.0.0.46");
        device.add_shadow_component("Lamp");
        device.add_shadow_param("Lamp", info("brightness", 7, 1, 2));
        device.mirror.apply("Lamp", "brightness", 7, 0, 0, ParamValue::Int(5));
        device.mirror.apply("Lamp", "brightness", 7, 0, 1, ParamValue::Int(6));

        let snapshot = table.snapshot();
        let entry = &snapshot["10.0.0.46"];
        assert_eq!(entry["connected"], false);
        assert_eq!(entry["components"]["Lamp"]["brightness"]["values"]["0,0"], 5);
        assert_eq!(entry["components"]["Lamp"]["brightness"]["values"]["0,1"], 6);
    }
}
