//! In-process transport.
//!
//! Every successful [`MemoryConnector::connect`] produces a [`MemoryPeer`] on
//! the receiver returned by [`MemoryConnector::new`]. The peer plays the relay:
//! it reads what the channel sent and injects inbound frames or a close.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use relaycmd_core::{decode_frame, encode_frame, Frame, RelayError, RelayResult};

use super::{Connector, TransportEvent, TransportLink};

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            refuse: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (connector, rx)
    }

    /// Make subsequent connection attempts fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self) -> RelayResult<TransportLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("connection refused".into()));
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        self.peers
            .send(MemoryPeer {
                sent: outgoing_rx,
                inject: incoming_tx,
            })
            .map_err(|_| RelayError::Transport("no relay listening".into()))?;

        Ok(TransportLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

/// The relay side of an in-process connection.
#[derive(Debug)]
pub struct MemoryPeer {
    sent: mpsc::Receiver<String>,
    inject: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Next raw frame the channel sent, or `None` once it dropped its sender.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    pub async fn recv_value(&mut self) -> Option<Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let text = self.recv_text().await?;
        decode_frame(&text).ok()
    }

    pub async fn send_frame(&self, frame: &Frame) -> RelayResult<()> {
        self.send_text(encode_frame(frame)?).await
    }

    pub async fn send_value(&self, value: Value) -> RelayResult<()> {
        self.send_text(value.to_string()).await
    }

    pub async fn send_text(&self, text: String) -> RelayResult<()> {
        self.inject
            .send(TransportEvent::Frame(text))
            .await
            .map_err(|_| RelayError::Transport("channel side gone".into()))
    }

    /// Simulate the relay dropping the connection.
    pub async fn close(&self) {
        let _ = self.inject.send(TransportEvent::Closed(None)).await;
    }

    /// Whether the channel has dropped its end of the connection.
    pub fn is_closed_by_channel(&self) -> bool {
        self.inject.is_closed()
    }
}
