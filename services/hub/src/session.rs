//! Device sessions: one durable, auto-reconnecting WebSocket client per
//! remote device.
//!
//! Per device the supervisor drives the state machine
//! DISCONNECTED → CONNECTING → DISCOVERING → SUBSCRIBING → LISTENING, and
//! on any error waits out the reconnect delay and starts over.  The
//! listener task launches before the first request because discovery
//! responses arrive on the same stream; request/response correlation uses
//! a session-unique monotonically increasing `id` against a pending map.
//!
//! The mirror is not cleared on disconnect — readers keep the last known
//! values, flagged stale by `connected = false` — and is rebuilt from
//! scratch by the next discovery.

use crate::config::HubConfig;
use crate::state::DeviceHandle;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pb_protocol::{ComponentsResponse, ParamInfo, ParamType, ParamUpdate, ParamValue};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<serde_json::Value>>>>;

// ---------------------------------------------------------------------------
// Config and errors
// ---------------------------------------------------------------------------

/// Session timing knobs, extracted from the hub config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub reconnect_delay: Duration,
    pub discovery_delay: Duration,
    pub subscribe_delay: Duration,
    pub request_timeout: Duration,
}

impl From<&HubConfig> for SessionConfig {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            ping_interval: cfg.ping_interval,
            ping_timeout: cfg.ping_timeout,
            reconnect_delay: cfg.reconnect_delay,
            discovery_delay: cfg.discovery_delay,
            subscribe_delay: cfg.subscribe_delay,
            request_timeout: cfg.request_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request timed out")]
    RequestTimeout,
    #[error("ping timed out")]
    PingTimeout,
    #[error("connection closed")]
    Disconnected,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Manage one device connection until shutdown, reconnecting after errors.
pub async fn run_device_supervisor(
    device: Arc<DeviceHandle>,
    cfg: SessionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = device.endpoint.clone();
    while !*shutdown.borrow() {
        match run_session(&device, &cfg, &mut shutdown).await {
            // Clean exit: shutdown was requested.
            Ok(()) => break,
            Err(e) => warn!(endpoint = %endpoint, error = %e, "session error"),
        }
        device.set_connected(false);
        device.set_outbox(None);

        if *shutdown.borrow() {
            break;
        }
        info!(
            endpoint = %endpoint,
            delay_secs = cfg.reconnect_delay.as_secs(),
            "reconnecting after delay"
        );
        tokio::select! {
            biased;
            _ = shutdown.changed() => {}
            () = sleep(cfg.reconnect_delay) => {}
        }
    }
    device.set_connected(false);
    device.set_outbox(None);
    debug!(endpoint = %endpoint, "device supervisor exited");
}

/// One pass through the session state machine.  Returns `Ok(())` only when
/// shutdown was requested; every other exit is an error that triggers a
/// reconnect.
async fn run_session(
    device: &Arc<DeviceHandle>,
    cfg: &SessionConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    // CONNECTING
    let url = format!("ws://{}/ws", device.endpoint);
    info!(url = %url, "connecting");
    let (ws, _response) = timeout(cfg.request_timeout, connect_async(&url))
        .await
        .map_err(|_| SessionError::Connect(format!("timed out connecting to {url}")))?
        .map_err(|e| SessionError::Connect(e.to_string()))?;
    device.set_connected(true);
    info!(endpoint = %device.endpoint, "connected");

    let (sink, stream) = ws.split();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let last_rx = Arc::new(Mutex::new(Instant::now()));

    // The listener launches first: discovery responses arrive on the same
    // stream as push updates.
    let mut listener = tokio::spawn(listen_loop(
        stream,
        device.clone(),
        pending.clone(),
        out_tx.clone(),
        last_rx.clone(),
    ));
    let mut writer = tokio::spawn(write_loop(
        sink,
        out_rx,
        cfg.ping_interval,
        cfg.ping_timeout,
        last_rx,
    ));

    let io = SessionIo {
        endpoint: device.endpoint.clone(),
        out_tx: out_tx.clone(),
        pending,
        next_id: AtomicI64::new(0),
        request_timeout: cfg.request_timeout,
    };

    // DISCOVERING + SUBSCRIBING, raced against stream death and shutdown.
    let setup = async {
        discover(&io, device, cfg).await?;
        subscribe_all(&io, device, cfg).await;
        Ok::<(), SessionError>(())
    };
    tokio::pin!(setup);

    enum Phase {
        Shutdown,
        SetupDone(Result<(), SessionError>),
        TaskDied(SessionError),
    }

    let phase = tokio::select! {
        biased;
        _ = shutdown.changed() => Phase::Shutdown,
        setup_result = &mut setup => Phase::SetupDone(setup_result),
        listener_result = &mut listener => Phase::TaskDied(flatten_task(listener_result)),
        writer_result = &mut writer => Phase::TaskDied(flatten_task(writer_result)),
    };

    let result = match phase {
        Phase::Shutdown => Ok(()),
        Phase::TaskDied(e) | Phase::SetupDone(Err(e)) => Err(e),
        Phase::SetupDone(Ok(())) => {
            listen_steady(device, &out_tx, &mut listener, &mut writer, shutdown).await
        }
    };

    device.set_outbox(None);
    listener.abort();
    writer.abort();
    result
}

/// LISTENING: the steady state, held until the socket dies or shutdown.
async fn listen_steady(
    device: &Arc<DeviceHandle>,
    out_tx: &mpsc::UnboundedSender<Message>,
    listener: &mut tokio::task::JoinHandle<Result<(), SessionError>>,
    writer: &mut tokio::task::JoinHandle<Result<(), SessionError>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    device.set_outbox(Some(out_tx.clone()));
    info!(endpoint = %device.endpoint, "listening");

    tokio::select! {
        biased;
        _ = shutdown.changed() => Ok(()),
        listener_result = listener => Err(flatten_task(listener_result)),
        writer_result = writer => Err(flatten_task(writer_result)),
    }
}

fn flatten_task(result: Result<Result<(), SessionError>, tokio::task::JoinError>) -> SessionError {
    match result {
        Ok(Ok(())) | Err(_) => SessionError::Disconnected,
        Ok(Err(e)) => e,
    }
}

// ---------------------------------------------------------------------------
// Request/response correlation
// ---------------------------------------------------------------------------

struct SessionIo {
    endpoint: String,
    out_tx: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicI64,
    request_timeout: Duration,
}

impl SessionIo {
    /// Send a request frame and wait for the response carrying its `id`.
    async fn request(&self, mut frame: serde_json::Value) -> Result<serde_json::Value, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        frame["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        debug!(endpoint = %self.endpoint, frame = %frame, "sending request");
        if self
            .out_tx
            .send(Message::Text(frame.to_string().into()))
            .is_err()
        {
            self.forget(id);
            return Err(SessionError::Disconnected);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => {
                self.forget(id);
                error!(endpoint = %self.endpoint, frame = %frame, "request timed out");
                Err(SessionError::RequestTimeout)
            }
        }
    }

    fn forget(&self, id: i64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Discovery and subscription
// ---------------------------------------------------------------------------

/// DISCOVERING: enumerate components, then parameters per type in the
/// fixed order, pacing requests so slow firmware keeps up.  Any request
/// failure aborts the session.
async fn discover(
    io: &SessionIo,
    device: &Arc<DeviceHandle>,
    cfg: &SessionConfig,
) -> Result<(), SessionError> {
    info!(endpoint = %io.endpoint, "discovering components");
    device.begin_discovery();

    let response = io.request(json!({"type": "get_components"})).await?;
    let components: ComponentsResponse = serde_json::from_value(response)?;
    let names: Vec<String> = components
        .components
        .iter()
        .map(|c| c.name().to_owned())
        .collect();
    info!(endpoint = %io.endpoint, count = names.len(), components = ?names, "components found");

    for name in &names {
        device.add_shadow_component(name);
        for param_type in ParamType::DISCOVERY_ORDER {
            discover_params_of_type(io, device, cfg, name, param_type).await?;
            sleep(cfg.discovery_delay).await;
        }
    }

    let total: usize = device.shadow_snapshot().iter().map(|c| c.params.len()).sum();
    info!(
        endpoint = %io.endpoint,
        components = names.len(),
        params = total,
        "discovery complete"
    );
    Ok(())
}

async fn discover_params_of_type(
    io: &SessionIo,
    device: &Arc<DeviceHandle>,
    cfg: &SessionConfig,
    component: &str,
    param_type: ParamType,
) -> Result<(), SessionError> {
    let response = io
        .request(json!({
            "type": "get_param_info",
            "comp": component,
            "param_type": param_type.as_str(),
            "idx": -1,
        }))
        .await?;
    let count = response
        .get("count")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);

    for idx in 0..count {
        let response = io
            .request(json!({
                "type": "get_param_info",
                "comp": component,
                "param_type": param_type.as_str(),
                "idx": idx,
            }))
            .await?;

        // Entries without a name are holes in the device's table; skip.
        if response.get("name").is_none() {
            sleep(cfg.discovery_delay).await;
            continue;
        }
        match serde_json::from_value::<ParamInfo>(response) {
            Ok(mut info) => {
                // Some firmwares omit `type`; the request already fixes it.
                info.param_type.get_or_insert(param_type);
                device.add_shadow_param(component, info);
            }
            Err(e) => warn!(
                endpoint = %io.endpoint,
                component,
                param_type = %param_type,
                idx,
                error = %e,
                "malformed param info, skipping"
            ),
        }
        sleep(cfg.discovery_delay).await;
    }
    Ok(())
}

/// SUBSCRIBING: one subscribe per cell, in deterministic shadow order.
/// Individual failures are logged and do not abort the session; the cell
/// stays unset until the next push or reconnect.
async fn subscribe_all(io: &SessionIo, device: &Arc<DeviceHandle>, cfg: &SessionConfig) {
    let mut subscribed = 0usize;

    for comp in device.shadow_snapshot() {
        for info in &comp.params {
            for row in 0..info.rows {
                for col in 0..info.cols {
                    let request = json!({
                        "type": "subscribe",
                        "param_id": info.param_id,
                        "row": row,
                        "col": col,
                    });
                    match io.request(request).await {
                        Ok(response) => {
                            if let Some(raw) = response.get("value") {
                                match serde_json::from_value::<ParamValue>(raw.clone()) {
                                    Ok(value) => {
                                        device.mirror.apply(
                                            &comp.name, &info.name, info.param_id, row, col, value,
                                        );
                                        subscribed += 1;
                                    }
                                    Err(e) => warn!(
                                        endpoint = %io.endpoint,
                                        param = %info.name,
                                        error = %e,
                                        "unusable subscribe value"
                                    ),
                                }
                            }
                        }
                        Err(e) => warn!(
                            endpoint = %io.endpoint,
                            component = %comp.name,
                            param = %info.name,
                            row,
                            col,
                            error = %e,
                            "failed to subscribe to cell"
                        ),
                    }
                    sleep(cfg.subscribe_delay).await;
                }
            }
        }
    }

    info!(endpoint = %io.endpoint, cells = subscribed, "subscribed to parameter cells");
}

// ---------------------------------------------------------------------------
// Listener and writer tasks
// ---------------------------------------------------------------------------

async fn listen_loop(
    mut stream: SplitStream<WsStream>,
    device: Arc<DeviceHandle>,
    pending: Pending,
    out_tx: mpsc::UnboundedSender<Message>,
    last_rx: Arc<Mutex<Instant>>,
) -> Result<(), SessionError> {
    while let Some(msg) = stream.next().await {
        let msg = msg?;
        *last_rx.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        match msg {
            Message::Text(text) => handle_text(&device, &pending, &text),
            Message::Ping(data) => {
                let _ = out_tx.send(Message::Pong(data));
            }
            Message::Close(_) => return Err(SessionError::Disconnected),
            _ => {}
        }
    }
    Err(SessionError::Disconnected)
}

/// Route one inbound frame: correlated response, push update, or noise.
fn handle_text(device: &Arc<DeviceHandle>, pending: &Pending, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            error!(endpoint = %device.endpoint, error = %e, "invalid JSON from device");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(serde_json::Value::as_i64) {
        let slot = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(tx) = slot {
            let _ = tx.send(value);
            return;
        }
    }

    if value.get("type").and_then(serde_json::Value::as_str) == Some("param_update") {
        match serde_json::from_value::<ParamUpdate>(value) {
            Ok(update) => apply_update(device, &update),
            Err(e) => warn!(endpoint = %device.endpoint, error = %e, "malformed param_update"),
        }
        return;
    }

    debug!(endpoint = %device.endpoint, frame = %value, "ignoring unexpected message");
}

fn apply_update(device: &Arc<DeviceHandle>, update: &ParamUpdate) {
    let Some((component, info)) = device.find_param_by_id(update.param_id) else {
        warn!(
            endpoint = %device.endpoint,
            param_id = update.param_id,
            "update for unknown param_id"
        );
        return;
    };

    let old = device.mirror.apply(
        &component,
        &info.name,
        update.param_id,
        update.row,
        update.col,
        update.value.clone(),
    );
    info!(
        endpoint = %device.endpoint,
        component = %component,
        param = %info.name,
        row = update.row,
        col = update.col,
        old = old.as_ref().map(ToString::to_string),
        new = %update.value,
        "param update"
    );
}

/// Drain the outbox into the sink and keep the connection alive with
/// periodic pings.  Silence past `ping_interval + ping_timeout` is a
/// session error.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    ping_interval: Duration,
    ping_timeout: Duration,
    last_rx: Arc<Mutex<Instant>>,
) -> Result<(), SessionError> {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(msg) => sink.send(msg).await?,
                None => return Ok(()),
            },
            _ = ping.tick() => {
                let silent_for = last_rx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .elapsed();
                if silent_for > ping_interval + ping_timeout {
                    return Err(SessionError::PingTimeout);
                }
                sink.send(Message::Ping(Vec::new().into())).await?;
            }
        }
    }
}
