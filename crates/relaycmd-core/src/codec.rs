//! JSON text framing for the relay connection.
//!
//! Each transport message carries exactly one frame, so there is no length
//! prefix: the codec only maps between text and [`Frame`].

use crate::error::{RelayError, RelayResult};
use crate::frame::Frame;

/// Upper bound on an accepted frame (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Encode a frame as JSON text.
pub fn encode_frame(frame: &Frame) -> RelayResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one JSON text frame.
pub fn decode_frame(text: &str) -> RelayResult<Frame> {
    decode_frame_limited(text, MAX_FRAME_BYTES)
}

/// Decode one JSON text frame, rejecting frames above `max_bytes`.
pub fn decode_frame_limited(text: &str, max_bytes: usize) -> RelayResult<Frame> {
    if text.len() > max_bytes {
        return Err(RelayError::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            text.len(),
            max_bytes
        )));
    }
    Ok(serde_json::from_str(text)?)
}
