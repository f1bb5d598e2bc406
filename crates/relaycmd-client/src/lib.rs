//! relaycmd-client: authenticated relay channel with command dispatch.
//!
//! A [`Channel`] keeps one connection to a relay open: it authenticates with a
//! bearer token, pings to stay alive, reconnects after an unexpected close, and
//! dispatches `{command, params}` envelopes sent by other peers to handlers in
//! its [`CommandRegistry`]. [`Channel::send_command`] goes the other way.
//!
//! # Quick Start
//!
//! ```no_run
//! use relaycmd_client::{Channel, ChannelConfig, EnvToken, SenderInfo, WebSocketConnector};
//! use relaycmd_core::{Params, Target};
//!
//! # async fn example() -> relaycmd_core::RelayResult<()> {
//! let connector = WebSocketConnector::new("wss://relay.example.com/ws/api")?;
//! let channel = Channel::new(connector, EnvToken::new("RELAYCMD_TOKEN"), ChannelConfig::default());
//!
//! channel.register("hello", |params: &Params, sender: &SenderInfo| {
//!     println!("{} says {:?}", sender.display_name(), params.get("text"));
//!     Ok(())
//! });
//!
//! if channel.start(None).await {
//!     let outcome = channel
//!         .send_command(Target::User("u2".into()), "hello", Params::new())
//!         .await;
//!     println!("delivered: {}", outcome.delivered);
//! }
//! channel.stop();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod builtin;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod credentials;
pub mod dedup;
pub mod dispatcher;
pub mod gate;
pub mod registry;
pub mod transport;

// Re-export primary public types.
pub use builtin::{BuiltinCommand, Builtins, Capabilities, CodeSandbox, Surface};
pub use channel::{Channel, LinkState, SendOutcome, WeakChannel};
pub use config::ChannelConfig;
pub use correlator::PendingRequests;
pub use credentials::{CredentialProvider, EnvToken, StaticToken};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use gate::{GateVerdict, SenderGate};
pub use registry::{CommandHandler, CommandRegistry, HandlerError, HandlerResult, SenderInfo};
pub use transport::{Connector, MemoryConnector, TransportEvent, TransportLink, WebSocketConnector};

// Re-export relaycmd-core error types for convenience.
pub use relaycmd_core::{RelayError, RelayResult};
