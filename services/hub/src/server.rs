//! Protocol server: serves the hub's local components over the same
//! WebSocket protocol the hub speaks to remote devices.
//!
//! Change fan-out is a broadcast channel: a subscriber registered against
//! every local parameter posts `param_update` frames into the channel, and
//! each client task filters against its own subscription set.  A
//! subscribed, connected client therefore sees every change of its cells
//! exactly once; dropping the client task drops its subscriptions.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use pb_core::{Component, Parameter, Registry};
use pb_protocol::{
    ComponentsResponse, ComponentEntry, Incoming, NamedComponent, ParamType, ParamUpdate,
    ParamValue, Request, SetResponse, SubscribeResponse, ValueResponse,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Shared state handed to every client task.
#[derive(Clone)]
pub struct ServerState {
    registry: Arc<Registry>,
    updates_tx: broadcast::Sender<ParamUpdate>,
    connected_clients: Arc<Parameter>,
    total_messages: Arc<Parameter>,
    client_count: Arc<AtomicI64>,
    shutdown: watch::Receiver<bool>,
}

pub const COMPONENT: &str = "Server";

/// Build the server component and wire the change broadcast.
///
/// Must run after every other local component has registered: the
/// broadcast subscriber is attached to each parameter that exists now.
pub fn build(
    registry: Arc<Registry>,
    updates_tx: broadcast::Sender<ParamUpdate>,
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> ServerState {
    let mut comp = Component::new(COMPONENT, registry.allocator());
    comp.add_int("port", 1, 1, 0, 65_535, i64::from(port), true);
    comp.add_str("local_ip", 1, 1, &local_ip(), true);
    let connected_clients = comp.add_int("connected_clients", 1, 1, 0, 1000, 0, true);
    let total_messages = comp.add_int("total_messages", 1, 1, 0, 999_999_999, 0, true);
    registry.register(comp);

    // Every local parameter change becomes a param_update broadcast.
    for (_, param) in registry.all_params() {
        let tx = updates_tx.clone();
        let param_id = param.param_id();
        param.subscribe(Arc::new(move |_param, row, col, new, _old| {
            let _ = tx.send(ParamUpdate { param_id, row, col, value: new.clone() });
        }));
    }

    ServerState {
        registry,
        updates_tx,
        connected_clients,
        total_messages,
        client_count: Arc::new(AtomicI64::new(0)),
        shutdown,
    }
}

/// Accept protocol clients on an already-bound listener until shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ServerState,
) -> Result<(), std::io::Error> {
    let mut shutdown = state.shutdown.clone();
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

/// One task per client: requests in, correlated responses and subscribed
/// `param_update` frames out.
async fn handle_client(mut socket: WebSocket, state: ServerState) {
    let count = state.client_count.fetch_add(1, Ordering::SeqCst) + 1;
    let _ = state
        .connected_clients
        .set(0, 0, ParamValue::Int(count), true);
    info!(clients = count, "protocol client connected");

    let mut subscriptions: HashSet<(u32, u16, u16)> = HashSet::new();
    let mut updates_rx = state.updates_tx.subscribe();
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            update = updates_rx.recv() => match update {
                Ok(update) => {
                    if subscriptions.contains(&(update.param_id, update.row, update.col)) {
                        let Ok(text) = serde_json::to_string(&update) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "client fell behind on update broadcast");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                // Stats cell update must not re-broadcast per message.
                if let Ok(ParamValue::Int(total)) = state.total_messages.get(0, 0) {
                    let _ = state
                        .total_messages
                        .set(0, 0, ParamValue::Int(total.saturating_add(1)), false);
                }

                let reply = handle_frame(&state, &mut subscriptions, &text);
                if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // All of this client's subscriptions die with its task.
    let count = state.client_count.fetch_sub(1, Ordering::SeqCst) - 1;
    let _ = state
        .connected_clients
        .set(0, 0, ParamValue::Int(count), true);
    info!(clients = count, "protocol client disconnected");
}

// ---------------------------------------------------------------------------
// Message handling
// ---------------------------------------------------------------------------

/// Handle one frame and produce the reply, echoing any request `id`.
/// Errors are per-message; the connection stays open.
pub fn handle_frame(
    state: &ServerState,
    subscriptions: &mut HashSet<(u32, u16, u16)>,
    text: &str,
) -> serde_json::Value {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return serde_json::json!({"error": "Invalid JSON"});
    };
    let id = value.get("id").cloned();

    let Some(msg_type) = value.get("type").and_then(serde_json::Value::as_str) else {
        return with_id(serde_json::json!({"error": "missing type field"}), id);
    };
    let msg_type = msg_type.to_owned();

    let payload = match serde_json::from_value::<Incoming>(value) {
        Ok(incoming) => handle_request(state, subscriptions, incoming.request),
        Err(e) => {
            if e.to_string().contains("unknown variant") {
                serde_json::json!({"error": format!("unknown message type: {msg_type}")})
            } else {
                serde_json::json!({"error": e.to_string()})
            }
        }
    };

    with_id(payload, id)
}

fn with_id(mut payload: serde_json::Value, id: Option<serde_json::Value>) -> serde_json::Value {
    if let (Some(obj), Some(id)) = (payload.as_object_mut(), id) {
        obj.insert("id".to_owned(), id);
    }
    payload
}

fn handle_request(
    state: &ServerState,
    subscriptions: &mut HashSet<(u32, u16, u16)>,
    request: Request,
) -> serde_json::Value {
    match request {
        Request::GetComponents {} => {
            let components = state
                .registry
                .components()
                .iter()
                .map(|c| {
                    ComponentEntry::Named(NamedComponent { name: c.name().to_owned(), id: c.id() })
                })
                .collect();
            json_or_error(&ComponentsResponse { components })
        }

        Request::GetComponentParams { comp, comp_id } => {
            let found = match (comp, comp_id) {
                (Some(name), _) => state.registry.component(&name),
                (None, Some(id)) => state.registry.component_by_id(id),
                (None, None) => None,
            };
            match found {
                Some(component) => json_or_error(&component.describe()),
                None => serde_json::json!({"error": "component not found"}),
            }
        }

        Request::GetParamInfo { comp, param_type, idx } => {
            let Some(component) = state.registry.component(&comp) else {
                return serde_json::json!({"error": "component not found"});
            };
            let parsed_type = ParamType::parse(&param_type);
            if idx == -1 {
                let count = parsed_type.map_or(0, |t| component.count_of_type(t));
                return serde_json::json!({"count": count});
            }
            let found = usize::try_from(idx)
                .ok()
                .and_then(|i| parsed_type.and_then(|t| component.param_by_type_index(t, i)));
            match found {
                Some(param) => json_or_error(&param.describe()),
                None => serde_json::json!({"error": "index out of range"}),
            }
        }

        Request::GetParam { param_id, comp, param, param_type, idx, row, col } => {
            let Some((_, param)) = resolve_param(state, param_id, comp, param, param_type, idx)
            else {
                return serde_json::json!({"error": "parameter not found"});
            };
            match param.get(row, col) {
                Ok(value) => json_or_error(&ValueResponse {
                    name: param.name().to_owned(),
                    id: param.param_id(),
                    param_type: param.param_type(),
                    value,
                }),
                Err(e) => serde_json::json!({"error": e.to_string()}),
            }
        }

        Request::SetParam { param_id, comp, param, param_type, idx, row, col, value } => {
            let Some((_, param)) = resolve_param(state, param_id, comp, param, param_type, idx)
            else {
                return json_or_error(&SetResponse::failed("parameter not found"));
            };
            if param.read_only() {
                return json_or_error(&SetResponse::failed("parameter is read-only"));
            }
            let value = match value {
                Some(value) => value,
                // Null coerces to the empty string for string parameters
                // only; elsewhere it is a refused write.
                None if param.param_type() == ParamType::Str => ParamValue::Str(String::new()),
                None => return json_or_error(&SetResponse::failed("missing value field")),
            };
            match param.set(row, col, value, true) {
                Ok(_) => json_or_error(&SetResponse::ok()),
                Err(e) => json_or_error(&SetResponse::failed(e.to_string())),
            }
        }

        Request::Subscribe { param_id, row, col } => {
            let Some((_, param)) = state.registry.find_by_id(param_id) else {
                return serde_json::json!({"error": "parameter not found"});
            };
            match param.get(row, col) {
                Ok(value) => {
                    subscriptions.insert((param_id, row, col));
                    json_or_error(&SubscribeResponse { value })
                }
                Err(e) => serde_json::json!({"error": e.to_string()}),
            }
        }

        Request::Unsubscribe { param_id, row, col } => {
            subscriptions.remove(&(param_id, row, col));
            json_or_error(&SetResponse::ok())
        }
    }
}

/// The three lookup paths, in priority order: `param_id`, then
/// `(comp, param)` names, then `(comp, param_type, idx)`.
fn resolve_param(
    state: &ServerState,
    param_id: Option<u32>,
    comp: Option<String>,
    param: Option<String>,
    param_type: Option<String>,
    idx: Option<usize>,
) -> Option<(Arc<pb_core::Component>, Arc<Parameter>)> {
    if let Some(id) = param_id {
        return state.registry.find_by_id(id);
    }
    match (comp, param, param_type, idx) {
        (Some(comp), Some(param), _, _) => state.registry.find_by_name(&comp, &param),
        (Some(comp), None, Some(type_str), Some(idx)) => {
            state.registry.find_by_type_index(&comp, &type_str, idx)
        }
        _ => None,
    }
}

fn json_or_error<T: serde::Serialize>(payload: &T) -> serde_json::Value {
    serde_json::to_value(payload)
        .unwrap_or_else(|e| serde_json::json!({"error": format!("serialization: {e}")}))
}

fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (ServerState, Arc<Registry>) {
        let registry = Arc::new(Registry::new());

        let mut comp = Component::new("Relays", registry.allocator());
        comp.add_int("state", 1, 4, 0, 100, 0, false);
        comp.add_int("toggle_count", 1, 1, 0, 999_999, 0, true);
        comp.add_str("labels", 1, 4, "", false);
        registry.register(comp);

        let (updates_tx, _) = broadcast::channel(64);
        // handle_frame never waits on shutdown; dropping the sender is fine.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = build(registry.clone(), updates_tx, 8080, shutdown_rx);
        (state, registry)
    }

    fn frame(state: &ServerState, subs: &mut HashSet<(u32, u16, u16)>, text: &str) -> serde_json::Value {
        handle_frame(state, subs, text)
    }

    #[test]
    fn get_components_lists_local_components_with_stable_ids() {
        let (state, registry) = test_state();
        let mut subs = HashSet::new();
        let reply = frame(&state, &mut subs, r#"{"type": "get_components", "id": 4}"#);

        assert_eq!(reply["id"], 4);
        let names: Vec<&str> = reply["components"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Relays", COMPONENT]);

        let relays = registry.component("Relays").unwrap();
        assert_eq!(reply["components"][0]["id"], u64::from(relays.id()));
    }

    #[test]
    fn set_param_clamps_and_reports_success() {
        let (state, registry) = test_state();
        let mut subs = HashSet::new();

        let reply = frame(
            &state,
            &mut subs,
            r#"{"type": "set_param", "comp": "Relays", "param": "state",
                "row": 0, "col": 0, "value": 150}"#,
        );
        assert_eq!(reply["success"], true);

        let (_, param) = registry.find_by_name("Relays", "state").unwrap();
        assert_eq!(param.get(0, 0).unwrap(), ParamValue::Int(100));
    }

    #[test]
    fn read_only_parameters_reject_protocol_writes() {
        let (state, registry) = test_state();
        let mut subs = HashSet::new();

        let reply = frame(
            &state,
            &mut subs,
            r#"{"type": "set_param", "comp": "Relays", "param": "toggle_count", "value": 5}"#,
        );
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "parameter is read-only");

        // The stored value is untouched, and internal writes still work.
        let (_, param) = registry.find_by_name("Relays", "toggle_count").unwrap();
        assert_eq!(param.get(0, 0).unwrap(), ParamValue::Int(0));
        param.set(0, 0, ParamValue::Int(3), true).unwrap();
        assert_eq!(param.get(0, 0).unwrap(), ParamValue::Int(3));
    }

    #[test]
    fn get_param_info_counts_and_indexes_by_type() {
        let (state, _) = test_state();
        let mut subs = HashSet::new();

        let reply = frame(
            &state,
            &mut subs,
            r#"{"type": "get_param_info", "comp": "Relays", "param_type": "int", "idx": -1}"#,
        );
        assert_eq!(reply["count"], 2);

        let reply = frame(
            &state,
            &mut subs,
            r#"{"type": "get_param_info", "comp": "Relays", "param_type": "string", "idx": 0}"#,
        );
        assert_eq!(reply["name"], "labels");

        let reply = frame(
            &state,
            &mut subs,
            r#"{"type": "get_param_info", "comp": "Relays", "param_type": "int", "idx": 7}"#,
        );
        assert_eq!(reply["error"], "index out of range");
    }

    #[test]
    fn discovery_output_matches_get_component_params() {
        let (state, _) = test_state();
        let mut subs = HashSet::new();

        // Walk the legacy one-at-a-time discovery for Relays.
        let mut discovered = Vec::new();
        for param_type in ["int", "float", "bool", "str"] {
            let count_reply = frame(
                &state,
                &mut subs,
                &serde_json::json!({
                    "type": "get_param_info", "comp": "Relays",
                    "param_type": param_type, "idx": -1
                })
                .to_string(),
            );
            let count = count_reply["count"].as_u64().unwrap();
            for idx in 0..count {
                let info = frame(
                    &state,
                    &mut subs,
                    &serde_json::json!({
                        "type": "get_param_info", "comp": "Relays",
                        "param_type": param_type, "idx": idx
                    })
                    .to_string(),
                );
                discovered.push(info);
            }
        }

        let bulk = frame(&state, &mut subs, r#"{"type": "get_component_params", "comp": "Relays"}"#);
        let bulk_params = bulk["params"].as_array().unwrap();
        assert_eq!(discovered.len(), bulk_params.len());
        for info in &discovered {
            assert!(
                bulk_params.iter().any(|p| p["param_id"] == info["param_id"]
                    && p["name"] == info["name"]
                    && p["type"] == info["type"]),
                "discovered param missing from bulk listing: {info}"
            );
        }
    }

    #[test]
    fn subscribe_returns_current_value_and_tracks_the_set() {
        let (state, registry) = test_state();
        let mut subs = HashSet::new();
        let (_, param) = registry.find_by_name("Relays", "state").unwrap();
        param.set(0, 2, ParamValue::Int(9), false).unwrap();

        let reply = frame(
            &state,
            &mut subs,
            &serde_json::json!({
                "type": "subscribe", "param_id": param.param_id(), "row": 0, "col": 2
            })
            .to_string(),
        );
        assert_eq!(reply["value"], 9);
        assert!(subs.contains(&(param.param_id(), 0, 2)));

        let reply = frame(
            &state,
            &mut subs,
            &serde_json::json!({
                "type": "unsubscribe", "param_id": param.param_id(), "row": 0, "col": 2
            })
            .to_string(),
        );
        assert_eq!(reply["success"], true);
        assert!(subs.is_empty());
    }

    #[test]
    fn malformed_and_unknown_frames_yield_error_payloads() {
        let (state, _) = test_state();
        let mut subs = HashSet::new();

        let reply = frame(&state, &mut subs, "{not json");
        assert_eq!(reply["error"], "Invalid JSON");

        let reply = frame(&state, &mut subs, r#"{"row": 0}"#);
        assert_eq!(reply["error"], "missing type field");

        let reply = frame(&state, &mut subs, r#"{"type": "reboot", "id": 9}"#);
        assert_eq!(reply["error"], "unknown message type: reboot");
        assert_eq!(reply["id"], 9);
    }

    #[test]
    fn set_alias_and_id_echo_work_together() {
        let (state, registry) = test_state();
        let mut subs = HashSet::new();
        let (_, param) = registry.find_by_name("Relays", "state").unwrap();

        let reply = frame(
            &state,
            &mut subs,
            &serde_json::json!({
                "type": "SET", "param_id": param.param_id(),
                "row": 0, "col": 1, "value": 42, "id": 77
            })
            .to_string(),
        );
        assert_eq!(reply["success"], true);
        assert_eq!(reply["id"], 77);
        assert_eq!(param.get(0, 1).unwrap(), ParamValue::Int(42));
    }

    #[test]
    fn null_value_clears_string_params_but_refuses_numeric() {
        let (state, registry) = test_state();
        let mut subs = HashSet::new();
        let (_, labels) = registry.find_by_name("Relays", "labels").unwrap();
        labels.set(0, 0, ParamValue::Str("kitchen".to_owned()), false).unwrap();

        let reply = frame(
            &state,
            &mut subs,
            r#"{"type": "set_param", "comp": "Relays", "param": "labels", "value": null}"#,
        );
        assert_eq!(reply["success"], true);
        assert_eq!(labels.get(0, 0).unwrap(), ParamValue::Str(String::new()));

        let reply = frame(
            &state,
            &mut subs,
            r#"{"type": "set_param", "comp": "Relays", "param": "state", "value": null}"#,
        );
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "missing value field");
    }

    #[test]
    fn local_changes_broadcast_param_updates() {
        let (state, registry) = test_state();
        let mut updates_rx = state.updates_tx.subscribe();

        let (_, param) = registry.find_by_name("Relays", "state").unwrap();
        param.set(0, 0, ParamValue::Int(5), true).unwrap();

        let update = updates_rx.try_recv().unwrap();
        assert_eq!(update.param_id, param.param_id());
        assert_eq!(update.value, ParamValue::Int(5));

        // notify=false writes stay out of the broadcast.
        param.set(0, 0, ParamValue::Int(6), false).unwrap();
        assert!(updates_rx.try_recv().is_err());
    }
}
