// mock_device: A mock parameter-bus device for testing hub sessions.
//
// Serves the device side of the wire protocol on ws://127.0.0.1:<port>:
// answers discovery (`get_components`, `get_param_info`), `subscribe` with
// the current cell value, and applies `SET`/`set_param` frames to its value
// table (recording them for assertions and pushing a `param_update` to
// every connected client).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use pb_protocol::{
    ComponentEntry, ComponentsResponse, CountResponse, Incoming, NamedComponent, ParamInfo,
    ParamUpdate, ParamValue, Request, SubscribeResponse, stable_component_id,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// One scripted parameter of a mock device.
#[derive(Debug, Clone)]
pub struct MockParam {
    pub info: ParamInfo,
    pub initial: ParamValue,
}

impl MockParam {
    pub fn int(
        name: &str,
        param_id: u32,
        rows: u16,
        cols: u16,
        min: i64,
        max: i64,
        initial: ParamValue,
    ) -> Self {
        Self {
            info: ParamInfo {
                name: name.to_owned(),
                param_id,
                param_type: Some(pb_protocol::ParamType::Int),
                rows,
                cols,
                read_only: false,
                min: Some(ParamValue::Int(min)),
                max: Some(ParamValue::Int(max)),
            },
            initial,
        }
    }

    pub fn float(
        name: &str,
        param_id: u32,
        rows: u16,
        cols: u16,
        min: f64,
        max: f64,
        initial: ParamValue,
    ) -> Self {
        Self {
            info: ParamInfo {
                name: name.to_owned(),
                param_id,
                param_type: Some(pb_protocol::ParamType::Float),
                rows,
                cols,
                read_only: false,
                min: Some(ParamValue::Float(min)),
                max: Some(ParamValue::Float(max)),
            },
            initial,
        }
    }

    pub fn bool(name: &str, param_id: u32, rows: u16, cols: u16, initial: ParamValue) -> Self {
        Self {
            info: ParamInfo {
                name: name.to_owned(),
                param_id,
                param_type: Some(pb_protocol::ParamType::Bool),
                rows,
                cols,
                read_only: false,
                min: None,
                max: None,
            },
            initial,
        }
    }

    pub fn str(name: &str, param_id: u32, rows: u16, cols: u16, initial: ParamValue) -> Self {
        Self {
            info: ParamInfo {
                name: name.to_owned(),
                param_id,
                param_type: Some(pb_protocol::ParamType::Str),
                rows,
                cols,
                read_only: false,
                min: None,
                max: None,
            },
            initial,
        }
    }
}

/// The scripted parameter space a mock device advertises.
#[derive(Debug, Clone, Default)]
pub struct MockDeviceSpec {
    pub components: Vec<(String, Vec<MockParam>)>,
}

impl MockDeviceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_component(&mut self, name: &str, params: Vec<MockParam>) {
        self.components.push((name.to_owned(), params));
    }
}

#[derive(Clone)]
struct Shared {
    spec: Arc<MockDeviceSpec>,
    /// `(param_id, row, col)` -> current value.
    values: Arc<Mutex<HashMap<(u32, u16, u16), ParamValue>>>,
    /// Every SET/set_param frame received, in arrival order.
    sets: Arc<Mutex<Vec<serde_json::Value>>>,
    /// Outboxes of live connections, for server-initiated pushes.
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
}

/// A mock device bound to a random local port.
///
/// Each test spins up its own isolated instance; connections are handled
/// in background tasks owned by the accept loop.
pub struct MockDevice {
    addr: SocketAddr,
    shared: Shared,
    _task: tokio::task::JoinHandle<()>,
}

impl MockDevice {
    pub async fn start(spec: MockDeviceSpec) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let mut values = HashMap::new();
        for (_, params) in &spec.components {
            for p in params {
                for row in 0..p.info.rows {
                    for col in 0..p.info.cols {
                        values.insert((p.info.param_id, row, col), p.initial.clone());
                    }
                }
            }
        }

        let shared = Shared {
            spec: Arc::new(spec),
            values: Arc::new(Mutex::new(values)),
            sets: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(Mutex::new(Vec::new())),
        };

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_shared).await;
        });

        Ok(Self { addr, shared, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// SET frames received so far.
    pub fn received_sets(&self) -> Vec<serde_json::Value> {
        self.shared
            .sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Update a cell and push a `param_update` to every live connection.
    pub fn push_update(&self, param_id: u32, row: u16, col: u16, value: ParamValue) {
        self.shared.apply_update(param_id, row, col, value);
    }

    /// Drop every live connection (simulates a device reboot).
    pub fn drop_connections(&self) {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, shared: Shared) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let conn_shared = shared.clone();
                    tokio::spawn(async move {
                        // Connection errors are expected in tests (client
                        // drops, forced reconnect); swallow them.
                        let _ = Self::handle_connection(stream, conn_shared).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        shared: Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx.clone());

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(msg) => write.send(msg).await?,
                        // Outbox dropped by drop_connections(): close.
                        None => break,
                    }
                }
                inbound = read.next() => {
                    let msg = match inbound {
                        None => break,
                        Some(msg) => msg?,
                    };
                    match msg {
                        Message::Text(text) => {
                            if let Some(reply) = shared.handle_text(&text) {
                                write.send(Message::Text(reply.to_string().into())).await?;
                            }
                        }
                        Message::Ping(data) => write.send(Message::Pong(data)).await?,
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| !c.same_channel(&tx));
        Ok(())
    }
}

impl Shared {
    fn apply_update(&self, param_id: u32, row: u16, col: u16, value: ParamValue) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((param_id, row, col), value.clone());

        let update = ParamUpdate { param_id, row, col, value };
        let text = match serde_json::to_string(&update) {
            Ok(text) => text,
            Err(_) => return,
        };
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for conn in connections {
            let _ = conn.send(Message::Text(text.clone().into()));
        }
    }

    /// Handle one request frame; returns the reply (with the request `id`
    /// echoed), or `None` for fire-and-forget frames.
    fn handle_text(&self, text: &str) -> Option<serde_json::Value> {
        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(_) => return Some(serde_json::json!({"error": "Invalid JSON"})),
        };
        let id = incoming.id;

        let payload = match incoming.request {
            Request::GetComponents {} => {
                let components = self
                    .spec
                    .components
                    .iter()
                    .map(|(name, _)| {
                        ComponentEntry::Named(NamedComponent {
                            name: name.clone(),
                            id: stable_component_id(name),
                        })
                    })
                    .collect();
                serde_json::to_value(ComponentsResponse { components }).ok()?
            }
            Request::GetParamInfo { comp, param_type, idx } => {
                let params = self.spec.components.iter().find(|(name, _)| *name == comp);
                let Some((_, params)) = params else {
                    return Some(with_id(serde_json::json!({"error": "component not found"}), id));
                };
                let wanted = pb_protocol::ParamType::parse(&param_type);
                let typed: Vec<&MockParam> = params
                    .iter()
                    .filter(|p| p.info.param_type == wanted)
                    .collect();
                if idx < 0 {
                    serde_json::to_value(CountResponse { count: typed.len() }).ok()?
                } else {
                    match typed.get(idx as usize) {
                        Some(p) => serde_json::to_value(&p.info).ok()?,
                        None => serde_json::json!({"error": "index out of range"}),
                    }
                }
            }
            Request::Subscribe { param_id, row, col } => {
                let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
                match values.get(&(param_id, row, col)) {
                    Some(value) => {
                        serde_json::to_value(SubscribeResponse { value: value.clone() }).ok()?
                    }
                    None => serde_json::json!({"error": "parameter not found"}),
                }
            }
            Request::SetParam { param_id, row, col, value, .. } => {
                self.sets
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(serde_json::from_str(text).unwrap_or_default());
                if let (Some(param_id), Some(value)) = (param_id, value) {
                    self.apply_update(param_id, row, col, value);
                }
                // SET without an id expects no reply.
                if id.is_none() {
                    return None;
                }
                serde_json::json!({"success": true})
            }
            Request::Unsubscribe { .. } => serde_json::json!({"success": true}),
            _ => serde_json::json!({"error": "unsupported by mock device"}),
        };

        Some(with_id(payload, id))
    }
}

fn with_id(mut payload: serde_json::Value, id: Option<i64>) -> serde_json::Value {
    if let (Some(obj), Some(id)) = (payload.as_object_mut(), id) {
        obj.insert("id".to_owned(), serde_json::json!(id));
    }
    payload
}
