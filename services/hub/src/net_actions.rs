//! Network-actions engine: 100 slot-indexed outbound message configs.
//!
//! Writing a slot index into the `trigger` cell fires that slot's message
//! asynchronously (UDP, TCP, HTTP(S), or WS(S)); the trigger resets to the
//! `-1` idle sentinel without re-notifying.  Success and failure both land
//! in the read-only `last_response` cell; the engine never propagates
//! errors to its caller.

use crate::state::Nicknames;
use pb_core::{Component, Parameter, Registry};
use pb_protocol::ParamValue;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

pub const NUM_SLOTS: u16 = 100;

/// Response read cap for raw TCP/UDP replies.
const READ_CAP: usize = 4096;

#[derive(Debug, Deserialize)]
struct SlotConfig {
    protocol: String,
    host: String,
    port: u16,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default)]
    await_response: bool,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl SlotConfig {
    /// Body as wire text: objects serialize to JSON (flagged so HTTP can
    /// add a Content-Type), strings go verbatim, anything else via JSON.
    fn body_text(&self) -> (String, bool) {
        match &self.body {
            None => (String::new(), false),
            Some(serde_json::Value::String(s)) => (s.clone(), false),
            Some(value @ serde_json::Value::Object(_)) => (value.to_string(), true),
            Some(other) => (other.to_string(), false),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum NetActionError {
    #[error("Timeout")]
    Timeout,
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0}")]
    Other(String),
}

/// The network-actions component.
pub struct NetActions {
    messages: Arc<Parameter>,
    last_response: Arc<Parameter>,
    nicknames: Nicknames,
    http: reqwest::Client,
}

impl NetActions {
    pub const COMPONENT: &'static str = "NetworkActions";

    /// Build and register the component.  Must be called within a tokio
    /// runtime: the trigger callback spawns onto the current handle.
    pub fn new(registry: &Registry, nicknames: Nicknames) -> Arc<Self> {
        let mut comp = Component::new(Self::COMPONENT, registry.allocator());
        let messages = comp.add_str("network_messages", NUM_SLOTS, 1, "", false);
        let trigger = comp.add_int("trigger", 1, 1, -1, i64::from(NUM_SLOTS) - 1, -1, false);
        let last_response = comp.add_str("last_response", 1, 1, "", true);
        registry.register(comp);

        let engine = Arc::new(Self {
            messages,
            last_response,
            nicknames,
            http: reqwest::Client::new(),
        });

        let weak = Arc::downgrade(&engine);
        let handle = tokio::runtime::Handle::current();
        trigger.subscribe(Arc::new(move |param, _row, _col, new, _old| {
            let ParamValue::Int(slot) = new else { return };
            // -1 is the idle sentinel; out-of-range is refused by the clamp.
            if *slot >= 0 {
                if let (Some(engine), Ok(slot)) = (weak.upgrade(), u16::try_from(*slot)) {
                    handle.spawn(async move { engine.execute(slot).await });
                }
                let _ = param.set(0, 0, ParamValue::Int(-1), false);
            }
        }));

        engine
    }

    /// Execute one slot's configured message.
    pub async fn execute(&self, slot: u16) {
        let Ok(ParamValue::Str(config_str)) = self.messages.get(slot, 0) else { return };
        if config_str.is_empty() {
            warn!(slot, "no config for network action");
            return;
        }

        let config: SlotConfig = match serde_json::from_str(&config_str) {
            Ok(config) => config,
            Err(e) => {
                error!(slot, error = %e, "invalid network action config");
                return;
            }
        };

        let protocol = config.protocol.to_ascii_uppercase();
        let host = self.nicknames.resolve(&config.host);
        let wait = Duration::from_millis(config.timeout_ms);
        info!(slot, protocol = %protocol, host = %host, port = config.port, "executing network action");

        let result = match protocol.as_str() {
            "UDP" => self.send_udp(&host, &config, wait).await,
            "TCP" => self.send_tcp(&host, &config, wait).await,
            "HTTP" | "HTTPS" => self.send_http(&protocol, &host, &config, wait).await,
            "WS" | "WSS" => self.send_ws(&protocol, &host, &config, wait).await,
            other => Err(NetActionError::Other(format!("unknown protocol: {other}"))),
        };

        match result {
            Ok(Some(response)) => {
                let preview: String = response.chars().take(100).collect();
                debug!(slot, response = %preview, "network action response");
                let _ = self
                    .last_response
                    .set(0, 0, ParamValue::Str(response), true);
            }
            Ok(None) => {}
            Err(NetActionError::Timeout) => {
                warn!(slot, timeout_ms = config.timeout_ms, "network action timed out");
                let _ = self.last_response.set(
                    0,
                    0,
                    ParamValue::Str(format!("ERROR: Timeout after {}ms", config.timeout_ms)),
                    true,
                );
            }
            Err(e) => {
                error!(slot, error = %e, "network action failed");
                let _ = self
                    .last_response
                    .set(0, 0, ParamValue::Str(format!("ERROR: {e}")), true);
            }
        }
    }

    // -- protocol senders --

    async fn send_udp(
        &self,
        host: &str,
        config: &SlotConfig,
        wait: Duration,
    ) -> Result<Option<String>, NetActionError> {
        let (body, _) = config.body_text();
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(body.as_bytes(), (host, config.port)).await?;

        if !config.await_response {
            return Ok(None);
        }
        let mut buf = vec![0u8; READ_CAP];
        let (n, _peer) = timeout(wait, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NetActionError::Timeout)??;
        Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()))
    }

    async fn send_tcp(
        &self,
        host: &str,
        config: &SlotConfig,
        wait: Duration,
    ) -> Result<Option<String>, NetActionError> {
        let (body, _) = config.body_text();
        let mut stream = timeout(wait, TcpStream::connect((host, config.port)))
            .await
            .map_err(|_| NetActionError::Timeout)??;
        stream.write_all(body.as_bytes()).await?;

        if !config.await_response {
            return Ok(None);
        }
        let mut buf = vec![0u8; READ_CAP];
        let n = timeout(wait, stream.read(&mut buf))
            .await
            .map_err(|_| NetActionError::Timeout)??;
        Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()))
    }

    async fn send_http(
        &self,
        protocol: &str,
        host: &str,
        config: &SlotConfig,
        wait: Duration,
    ) -> Result<Option<String>, NetActionError> {
        let scheme = if protocol == "HTTPS" { "https" } else { "http" };
        let path = config.path.as_deref().unwrap_or("/");
        let url = format!("{scheme}://{host}:{}{path}", config.port);

        let method = config
            .method
            .as_deref()
            .map_or(Ok(reqwest::Method::GET), |m| {
                reqwest::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
            })
            .map_err(|e| NetActionError::Other(format!("invalid method: {e}")))?;

        let (body, body_is_json) = config.body_text();
        let mut request = self.http.request(method, &url).timeout(wait);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if body_is_json && !config.headers.contains_key("Content-Type") {
            request = request.header("Content-Type", "application/json");
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(map_reqwest)?;
        let text = response.text().await.map_err(map_reqwest)?;
        Ok(Some(text))
    }

    async fn send_ws(
        &self,
        protocol: &str,
        host: &str,
        config: &SlotConfig,
        wait: Duration,
    ) -> Result<Option<String>, NetActionError> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::protocol::Message;

        let scheme = if protocol == "WSS" { "wss" } else { "ws" };
        let path = config.path.as_deref().unwrap_or("/");
        let uri = format!("{scheme}://{host}:{}{path}", config.port);

        let (body, _) = config.body_text();
        let (mut ws, _response) = timeout(wait, tokio_tungstenite::connect_async(&uri))
            .await
            .map_err(|_| NetActionError::Timeout)??;
        ws.send(Message::Text(body.into())).await?;

        let reply = if config.await_response {
            loop {
                match timeout(wait, ws.next()).await.map_err(|_| NetActionError::Timeout)? {
                    Some(Ok(Message::Text(text))) => break Some(text.to_string()),
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(NetActionError::Other("connection closed".to_owned()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        } else {
            None
        };

        let _ = ws.close(None).await;
        Ok(reply)
    }
}

fn map_reqwest(e: reqwest::Error) -> NetActionError {
    if e.is_timeout() {
        NetActionError::Timeout
    } else {
        NetActionError::Http(e)
    }
}
