// mock_client: A protocol client for driving hub servers (and the mock
// device) from tests.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use pb_protocol::Request;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct MockClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    next_id: i64,
    /// Frames received while waiting for a correlated response (typically
    /// `param_update` pushes), kept for `next_push`.
    stashed: VecDeque<serde_json::Value>,
}

impl MockClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read, next_id: 1, stashed: VecDeque::new() })
    }

    /// Send a raw JSON frame (no correlation id added).
    pub async fn send_json(
        &mut self,
        value: &serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(value.to_string().into())).await?;
        Ok(())
    }

    /// Send raw text, for malformed-input tests.
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Send a request with a fresh correlation id and wait for the frame
    /// echoing it.  Unrelated frames received meanwhile are stashed.
    pub async fn request(
        &mut self,
        request: &Request,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        let id = self.next_id;
        self.next_id += 1;

        let mut frame = serde_json::to_value(request)?;
        frame
            .as_object_mut()
            .ok_or("request did not serialize to an object")?
            .insert("id".to_owned(), serde_json::json!(id));
        self.send_json(&frame).await?;

        loop {
            let received = self.recv_json().await?;
            if received.get("id").and_then(serde_json::Value::as_i64) == Some(id) {
                return Ok(received);
            }
            self.stashed.push_back(received);
        }
    }

    /// Next received text frame as JSON (stashed frames first).
    pub async fn recv_json(&mut self) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        if let Some(frame) = self.stashed.pop_front() {
            return Ok(frame);
        }
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(&text)?);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Next `param_update` push frame, skipping anything else.
    pub async fn next_push(&mut self) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        if let Some(pos) = self
            .stashed
            .iter()
            .position(|f| f.get("type").and_then(serde_json::Value::as_str) == Some("param_update"))
        {
            // Earlier stashed non-push frames stay queued for recv_json.
            return Ok(self.stashed.remove(pos).expect("position just found"));
        }
        loop {
            let frame = self.recv_json().await?;
            if frame.get("type").and_then(serde_json::Value::as_str) == Some("param_update") {
                return Ok(frame);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
