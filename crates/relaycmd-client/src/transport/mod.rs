//! Transport seam for the relay channel.
//!
//! A [`Connector`] opens one physical connection and hands back a
//! [`TransportLink`]: a sender for outbound text frames and a receiver of
//! inbound transport events. Dropping the outbound sender closes the
//! connection. The receiver yields [`TransportEvent::Closed`] (or simply ends)
//! when the peer goes away.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

use std::future::Future;

use tokio::sync::mpsc;

use relaycmd_core::RelayResult;

/// Something that happened on an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame(String),
    /// The connection closed, with an optional reason.
    Closed(Option<String>),
}

/// The two halves of an open connection.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to the relay.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = RelayResult<TransportLink>> + Send;
}
