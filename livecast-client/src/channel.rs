//! Signaling channels
//!
//! The driver speaks to the server through a [`SignalingChannel`]: one JSON
//! text frame per message in each direction. [`WsChannel`] runs over a real
//! WebSocket, [`MemoryChannel`] over in-process queues.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use livecast_proto::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

#[async_trait]
pub trait SignalingChannel: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next server message, `None` once the channel is closed
    async fn recv(&mut self) -> Result<Option<ServerMessage>>;

    async fn close(&mut self);
}

/// Decode a server frame, skipping types this client does not know
fn decode(frame: &str) -> Option<ServerMessage> {
    match ServerMessage::parse(frame) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Ignoring invalid server frame");
            None
        }
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsChannel {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url).await?;
        debug!(url, "Signaling WebSocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_frame()?;
        self.stream.send(Message::text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(message) = decode(text.as_str()) {
                        return Ok(Some(message));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

/// In-process channel exchanging raw text frames
pub struct MemoryChannel {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<String>,
}

/// The far end of a [`MemoryChannel`]
pub struct MemoryChannelRemote {
    /// Frames the driver sent
    pub rx: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the driver
    pub tx: mpsc::UnboundedSender<String>,
}

impl MemoryChannel {
    #[must_use]
    pub fn pair() -> (Self, MemoryChannelRemote) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: Some(out_tx),
                inbound: in_rx,
            },
            MemoryChannelRemote {
                rx: out_rx,
                tx: in_tx,
            },
        )
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_frame()?;
        self.outbound
            .as_ref()
            .ok_or(ClientError::Closed)?
            .send(frame)
            .map_err(|_| ClientError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(frame) = self.inbound.recv().await {
            if let Some(message) = decode(&frame) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}
