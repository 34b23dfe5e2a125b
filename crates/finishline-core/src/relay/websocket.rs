//! WebSocket relay client
//!
//! Opens a WebSocket to the relay, waits for the `welcome` frame carrying
//! the connection id, then hands the socket to a pump task that turns
//! [`RelayCommand`]s into frames and frames into [`Invocation`]s.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::frame::{ClientFrame, ServerFrame};
use super::{Invocation, Relay, RelayCommand, RelayError, RelayLink, RelayResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default time allowed for the relay to send its welcome frame
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay reached over a WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    url: String,
    handshake_timeout: Duration,
}

impl WebSocketRelay {
    /// Create a relay client for the given `ws://` or `wss://` URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Relay URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Relay for WebSocketRelay {
    async fn connect(&self) -> RelayResult<RelayLink> {
        debug!("Connecting to relay {}", self.url);
        let (ws_stream, _response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|source| RelayError::Connect {
                    url: self.url.clone(),
                    source,
                })?;

        let (write, mut read) = ws_stream.split();
        let connection_id = wait_for_welcome(&mut read, &self.url, self.handshake_timeout).await?;
        debug!(connection_id = %connection_id, "Relay handshake complete");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (invocation_tx, invocation_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(
            connection_id.clone(),
            write,
            read,
            command_rx,
            invocation_tx,
        ));

        Ok(RelayLink {
            connection_id,
            commands: command_tx,
            invocations: invocation_rx,
        })
    }
}

/// Wait for the relay's welcome frame
async fn wait_for_welcome(
    read: &mut SplitStream<WsStream>,
    url: &str,
    timeout: Duration,
) -> RelayResult<String> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(RelayError::Timeout(url.to_string()));
        }

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                        Ok(ServerFrame::Welcome { connection_id }) => return Ok(connection_id),
                        Ok(ServerFrame::Error { message }) => {
                            return Err(RelayError::Handshake(message));
                        }
                        // Ignore other frames during handshake
                        Ok(_) => {}
                        Err(e) => warn!("Failed to decode relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(RelayError::Handshake(format!(
                            "relay ({}) closed connection during handshake",
                            url
                        )));
                    }
                    Some(Err(e)) => {
                        return Err(RelayError::Handshake(format!(
                            "relay ({}) connection error: {}",
                            url, e
                        )));
                    }
                    _ => {}
                }
            }
            _ = tokio::time::sleep(remaining) => {
                return Err(RelayError::Timeout(url.to_string()));
            }
        }
    }
}

/// Shuttle commands and invocations until either side goes away
async fn pump(
    connection_id: String,
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
    invocations: mpsc::UnboundedSender<Invocation>,
) {
    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    // Link dropped by its owner
                    write.close().await.ok();
                    break;
                };

                let bytes = match ClientFrame::from(cmd).encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Dropping relay command: {}", e);
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::Binary(bytes)).await {
                    warn!(connection_id = %connection_id, "Relay send failed: {}", e);
                    break;
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                        Ok(ServerFrame::Invocation { target, arguments }) => {
                            if invocations.send(Invocation { target, arguments }).is_err() {
                                write.close().await.ok();
                                break;
                            }
                        }
                        Ok(ServerFrame::Error { message }) => {
                            warn!(connection_id = %connection_id, "Relay error: {}", message);
                        }
                        Ok(ServerFrame::Welcome { .. }) => {}
                        Err(e) => warn!("Failed to decode relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, "Relay connection error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    debug!(connection_id = %connection_id, "Relay connection closed");
}
