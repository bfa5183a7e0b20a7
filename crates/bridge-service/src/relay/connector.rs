//! Relay links.
//!
//! A link is a pair of channels: frames to send and frames received. The
//! endpoint actor never sees the socket, which keeps it testable against an
//! in-memory relay. Dropping the outgoing sender closes the link.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use dm_proto::{ClientMessage, RelayMessage};

use super::RelayError;

const OUTGOING_CAPACITY: usize = 64;
const INCOMING_CAPACITY: usize = 256;

pub struct RelayLink {
    pub outgoing: mpsc::Sender<ClientMessage>,
    pub incoming: mpsc::Receiver<RelayMessage>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<RelayLink, RelayError>;
}

/// WebSocket connector. One pump task per open socket.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<RelayLink, RelayError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INCOMING_CAPACITY);
        tokio::spawn(pump(url.to_string(), socket, out_rx, in_tx));

        Ok(RelayLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Shuttle frames between the socket and the link channels until either
/// side goes away.
async fn pump(
    url: String,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::Receiver<ClientMessage>,
    incoming: mpsc::Sender<RelayMessage>,
) {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(relay = %url, error = %err, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(text.into())).await {
                    debug!(relay = %url, error = %err, "Socket write failed");
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match RelayMessage::from_json(text.as_str()) {
                    Ok(msg) => {
                        if incoming.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(relay = %url, error = %err, "Ignoring unparseable frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(relay = %url, error = %err, "Socket read failed");
                    break;
                }
            }
        }
    }

    debug!(relay = %url, "Socket closed");
}
