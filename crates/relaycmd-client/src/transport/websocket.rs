//! WebSocket transport for the relay channel.
//!
//! Each relay frame travels as one WebSocket text message. The socket is split
//! into a writer task (draining the outbound mpsc) and a reader task (feeding
//! the inbound mpsc), so the channel never touches tungstenite types directly.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use relaycmd_core::{RelayError, RelayResult};

use super::{Connector, TransportEvent, TransportLink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a relay over `ws://` or `wss://`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> RelayResult<Self> {
        let url = url.into();
        validate_url(&url)?;
        Ok(Self { url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Accept only WebSocket URL schemes.
pub fn validate_url(url: &str) -> RelayResult<()> {
    let lower = url.to_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        Ok(())
    } else {
        Err(RelayError::Transport(format!(
            "unsupported URL scheme: {url} (expected ws:// or wss://)"
        )))
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self) -> RelayResult<TransportLink> {
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::Transport(format!("WebSocket connect error: {e}")))?;

        info!(url = %self.url, "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<String>(256);
        let (incoming_tx, incoming_rx) = mpsc::channel::<TransportEvent>(256);

        tokio::spawn(write_loop(sink, outgoing_rx));
        tokio::spawn(read_loop(stream, incoming_tx));

        Ok(TransportLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outgoing: mpsc::Receiver<String>) {
    while let Some(text) = outgoing.recv().await {
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!(error = %e, "WebSocket send failed");
            break;
        }
    }

    // Outbound sender dropped: the channel wants this connection gone.
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    debug!("WebSocket writer ended");
}

async fn read_loop(mut stream: SplitStream<WsStream>, incoming: mpsc::Sender<TransportEvent>) {
    let mut reason = None;

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!("dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                reason = frame.map(|f| f.reason.to_string());
                debug!("WebSocket close frame received");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                reason = Some(e.to_string());
                break;
            }
        };

        if incoming.send(TransportEvent::Frame(text)).await.is_err() {
            debug!("inbound channel closed");
            return;
        }
    }

    let _ = incoming.send(TransportEvent::Closed(reason)).await;
    debug!("WebSocket reader ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_websocket_schemes() {
        assert!(validate_url("ws://127.0.0.1:3001/ws/api").is_ok());
        assert!(validate_url("WSS://relay.example.com/ws/api").is_ok());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(validate_url("https://relay.example.com").is_err());
        assert!(WebSocketConnector::new("ftp://x").is_err());
    }
}
