//! WebSocket signaling channel

use super::{SignalMessage, SignalingChannel};
use crate::peer::PeerId;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// URL that joins `room_id` as `peer_id` on the relay
pub fn room_url(base: &str, room_id: &str, peer_id: &PeerId) -> Result<String> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::InvalidConfig(format!("Invalid signaling URL '{}': {}", base, e)))?;
    url.query_pairs_mut()
        .append_pair("roomId", room_id)
        .append_pair("userId", peer_id.as_str());
    Ok(url.into())
}

/// Signaling channel over a WebSocket connection to the relay
pub struct WebSocketSignaling {
    /// Relay URL
    url: String,

    /// Outgoing frame sender
    tx: mpsc::UnboundedSender<Message>,
}

impl WebSocketSignaling {
    /// Connect to the relay
    ///
    /// Spawns a sender task and a receiver task. Decoded mesh envelopes are
    /// delivered on the returned receiver, which closes when the socket does.
    ///
    /// # Arguments
    ///
    /// * `url` - Relay URL (ws:// or wss://), usually built with [`room_url`]
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>)> {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling url must start with ws:// or wss://, got {}",
                url
            )));
        }

        info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, inbound_tx));

        Ok((
            Self {
                url: url.to_string(),
                tx,
            },
            inbound_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sender task: writes queued frames to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: decodes frames and forwards mesh envelopes
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inbound: mpsc::UnboundedSender<SignalMessage>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match SignalMessage::decode(&text) {
                    Ok(Some(message)) => {
                        debug!("Received {} from relay", message.name());
                        if inbound.send(message).is_err() {
                            debug!("Mesh dropped its signaling receiver");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to handle signaling message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        let text = message.encode()?;
        debug!("Sending {} to relay", message.name());
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::SignalingError("signaling connection closed".to_string()))
    }
}
