//! A minimal websocket client for integration tests.
//!
//! Connect, send a typed message, receive and parse a typed message, close.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use retrotro_wire::{InboundMessage, OutboundEvent};

#[derive(Debug, thiserror::Error)]
pub enum TestClientError {
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,
    #[error("frame was not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// A test double for a retrotro client: connects with a bearer token in the
/// handshake URL, then sends/receives typed frames.
pub struct TestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connects to `addr` (host:port) with the given bearer token.
    pub async fn connect(addr: impl std::fmt::Display, token: &str) -> Self {
        let url = format!("ws://{addr}/?token={token}");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .expect("failed to connect");
        Self { stream }
    }

    /// Sends a typed inbound message as a single text frame.
    pub async fn send(&mut self, message: &InboundMessage) -> Result<(), TestClientError> {
        let frame = serde_json::to_string(message)?;
        self.stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    /// Receives and parses one outbound event. A server-coalesced frame
    /// with more than one `\n`-joined event only returns the first; use
    /// [`TestClient::recv_batch`] to see the whole frame.
    pub async fn recv(&mut self) -> Result<OutboundEvent, TestClientError> {
        let batch = self.recv_batch().await?;
        batch
            .into_iter()
            .next()
            .ok_or(TestClientError::UnexpectedEndOfStream)
    }

    /// Receives one websocket frame and parses every `\n`-joined event in it.
    pub async fn recv_batch(&mut self) -> Result<Vec<OutboundEvent>, TestClientError> {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), self.stream.next())
            .await?
            .ok_or(TestClientError::UnexpectedEndOfStream)??;
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            // Close/ping/pong frames never carry events.
            _ => return Err(TestClientError::UnexpectedEndOfStream),
        };
        text.lines()
            .map(|line| serde_json::from_str(line).map_err(TestClientError::from))
            .collect()
    }

    /// Closes the connection.
    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
