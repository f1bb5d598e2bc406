//! relaycmd-core: Shared protocol library for relay command channels.
//!
//! Provides the JSON wire frames, the `{command, params}` envelope, the frame
//! codec, the injection screen applied by relays, and the error type shared by
//! the client, server, and CLI crates.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod screen;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, decode_frame_limited, encode_frame, MAX_FRAME_BYTES};
pub use envelope::{CommandEnvelope, Params};
pub use error::{RelayError, RelayResult};
pub use frame::{
    unix_millis, AuthRequest, AuthResponse, ConsoleMessage, DirectMessage,
    DirectMessageResponse, Frame, PeerAddress, SecurityViolation, Target,
};
pub use screen::{find_injection, screen, INJECTION_CODE};
