//! Core server: accepts WebSocket connections and runs one frame loop per
//! connection against the shared [`Relay`].

use crate::config::ServerConfig;
use crate::relay::{ConnectionState, Relay};
use crate::transport::websocket::{self, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use relaycmd_core::{encode_frame, RelayError, RelayResult};

/// Outbound frames buffered per connection before deliveries back-pressure.
const OUTBOUND_BUFFER: usize = 64;
const GC_INTERVAL: Duration = Duration::from_secs(60);

pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        if config.users.is_empty() {
            warn!("no users configured, every auth attempt will fail");
        } else {
            info!(count = config.users.len(), "loaded users");
        }
        Self {
            relay: Arc::new(Relay::new(&config)),
            config,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Returns the bound address and the accept loop's handle.
    pub async fn listen(self) -> RelayResult<(SocketAddr, JoinHandle<()>)> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid listen address: {e}")))?;
        let (local_addr, mut ws_rx) = websocket::start_listener(addr).await?;

        let server = Arc::new(self);

        let gc_relay = server.relay.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                gc_relay.gc().await;
            }
        });

        info!(addr = %local_addr, "relaycmd-server ready");

        let handle = tokio::spawn(async move {
            while let Some(conn) = ws_rx.recv().await {
                let srv = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = srv.handle_websocket(conn).await {
                        warn!(error = %e, "WebSocket connection error");
                    }
                });
            }
            info!("listener closed, shutting down");
            let _ = server.shutdown_tx.send(());
        });

        Ok((local_addr, handle))
    }

    /// Serve until the listener closes.
    pub async fn run(self) -> RelayResult<()> {
        let (_addr, handle) = self.listen().await?;
        handle
            .await
            .map_err(|e| RelayError::Other(format!("accept loop failed: {e}")))
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> RelayResult<()> {
        let remote = conn.remote_addr;
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let mut state = self.relay.open(remote.ip(), outbound_tx);
        info!(remote = %remote, connection_id = state.id, "handling WebSocket connection");

        let result = self.session_loop(&mut conn, &mut state, outbound_rx).await;

        self.relay.close(&state).await;
        debug!(remote = %remote, connection_id = state.id, "connection closed");
        result
    }

    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        state: &mut ConnectionState,
        mut outbound_rx: mpsc::Receiver<String>,
    ) -> RelayResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("shutdown signal received, closing WebSocket client");
                    let _ = conn.ws_stream.close(None).await;
                    break;
                }

                // Deliveries routed here from other connections.
                Some(text) = outbound_rx.recv() => {
                    websocket::ws_send_text(&mut conn.ws_stream, &text).await?;
                }

                ws_result = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match ws_result {
                        Ok(Some(text)) => {
                            for reply in self.relay.handle_text(state, &text).await {
                                let text = encode_frame(&reply)?;
                                websocket::ws_send_text(&mut conn.ws_stream, &text).await?;
                            }
                        }
                        Ok(None) => {
                            debug!("WebSocket session ended (peer closed)");
                            break;
                        }
                        Err(e) => {
                            debug!(error = %e, "WebSocket session ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_digest;
    use crate::config::UserEntry;
    use futures_util::{SinkExt, StreamExt};
    use relaycmd_client::{Channel, ChannelConfig, SenderInfo, StaticToken, WebSocketConnector};
    use relaycmd_core::{decode_frame, Frame, Params, Target};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message;

    fn config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1".into(),
            port: 0,
            queue_limit: 10,
            max_frame_bytes: relaycmd_core::MAX_FRAME_BYTES,
            users: vec![
                UserEntry {
                    user_id: "alice".into(),
                    username: Some("Alice".into()),
                    phone: Some("+100".into()),
                    token_sha256: token_digest("alice-token"),
                    actors: Vec::new(),
                },
                UserEntry {
                    user_id: "bob".into(),
                    username: Some("Bob".into()),
                    phone: None,
                    token_sha256: token_digest("bob-token"),
                    actors: Vec::new(),
                },
            ],
        }
    }

    async fn start() -> SocketAddr {
        let (addr, _handle) = RelayServer::new(config()).listen().await.unwrap();
        addr
    }

    fn channel(addr: SocketAddr, token: &str) -> Channel<WebSocketConnector> {
        let url = format!("ws://{addr}");
        let connector = WebSocketConnector::new(url).unwrap();
        let mut config = ChannelConfig::default();
        config.keepalive_interval = Duration::ZERO;
        Channel::new(connector, StaticToken::new(token), config)
    }

    #[tokio::test]
    async fn raw_socket_auth_and_ping() {
        let addr = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected text reply");
        };
        assert_eq!(decode_frame(&text).unwrap(), Frame::Pong);

        let auth = json!({"type": "auth", "action": "me", "requestId": "a1", "token": "bob-token"});
        ws.send(Message::Text(auth.to_string())).await.unwrap();
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected text reply");
        };
        let Frame::AuthResponse(resp) = decode_frame(&text).unwrap() else {
            panic!("expected auth-response");
        };
        assert!(resp.success);
        assert_eq!(resp.user_id().as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn command_flows_between_channels() {
        let addr = start().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bob = channel(addr, "bob-token");
        bob.register("greet", move |params: &Params, sender: &SenderInfo| {
            let _ = tx.send((params.clone(), sender.user_id.clone()));
            Ok(())
        });
        assert!(bob.start(None).await);
        assert_eq!(bob.current_user_id().as_deref(), Some("bob"));

        let alice = channel(addr, "alice-token");
        assert!(alice.start(None).await);

        let mut params = Params::new();
        params.insert("text".into(), json!("hi"));
        let outcome = alice
            .send_command(Target::User("bob".into()), "greet", params)
            .await;
        assert!(outcome.success);
        assert!(outcome.delivered);

        let (params, from) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params.get("text"), Some(&json!("hi")));
        assert_eq!(from.as_deref(), Some("alice"));

        alice.stop();
        bob.stop();
    }

    #[tokio::test]
    async fn bad_token_fails_start() {
        let addr = start().await;
        let mallory = channel(addr, "nope");
        assert!(!mallory.start(None).await);
        mallory.stop();
    }
}
