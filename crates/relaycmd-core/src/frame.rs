//! Wire frames exchanged with the relay.
//!
//! Every frame is a JSON object discriminated by its `type` field. Field names
//! are camelCase on the wire. Frames with an unrecognised `type` decode to
//! [`Frame::Unknown`] so that new relay traffic never breaks older clients.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// The only `action` the relay understands on an `auth` frame.
pub const AUTH_ACTION_ME: &str = "me";

/// A protocol frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Auth(AuthRequest),
    AuthResponse(AuthResponse),
    Ping,
    Pong,
    DirectMessage(DirectMessage),
    DirectMessageResponse(DirectMessageResponse),
    ConsoleMessage(ConsoleMessage),
    SecurityViolation(SecurityViolation),
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// The wire `type` of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::AuthResponse(_) => "auth-response",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::DirectMessage(_) => "direct-message",
            Self::DirectMessageResponse(_) => "direct-message-response",
            Self::ConsoleMessage(_) => "console-message",
            Self::SecurityViolation(_) => "security-violation",
            Self::Unknown => "unknown",
        }
    }

    /// Correlation id carried by request and response frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Auth(f) => Some(&f.request_id),
            Self::AuthResponse(f) => Some(&f.request_id),
            Self::DirectMessage(f) => Some(&f.request_id),
            Self::DirectMessageResponse(f) => Some(&f.request_id),
            Self::SecurityViolation(f) => f.request_id.as_deref(),
            _ => None,
        }
    }

    /// Protocol-management frames: keepalive acks and request acknowledgments.
    /// These never reach command dispatch.
    pub fn is_management(&self) -> bool {
        matches!(
            self,
            Self::Pong | Self::AuthResponse(_) | Self::DirectMessageResponse(_)
        )
    }
}

/// `auth` request sent right after the transport opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub action: String,
    pub request_id: String,
    pub token: String,
    /// Logical identity to route messages to, when several actors share a token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_as: Option<String>,
}

impl AuthRequest {
    pub fn me(request_id: String, token: String, register_as: Option<String>) -> Self {
        Self {
            action: AUTH_ACTION_ME.to_string(),
            request_id,
            token,
            register_as,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Keys a relay may use for the user id inside `auth-response.user`, in lookup order.
const USER_ID_KEYS: &[&str] = &["user_id", "userId", "atome_id", "id", "sub"];

impl AuthResponse {
    /// The identity the relay resolved for the presented token.
    pub fn user_id(&self) -> Option<String> {
        let user = self.user.as_ref()?;
        USER_ID_KEYS
            .iter()
            .filter_map(|key| user.get(*key))
            .find_map(scalar_to_string)
    }

    pub fn username(&self) -> Option<String> {
        self.user
            .as_ref()
            .and_then(|u| u.get("username"))
            .and_then(scalar_to_string)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Addressing for a `direct-message`: exactly one of user id or phone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    User(String),
    Phone(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Phone(phone) => write!(f, "phone:{phone}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_phone: Option<String>,
    pub message: String,
}

impl DirectMessage {
    pub fn new(request_id: String, target: &Target, message: String) -> Self {
        let (to_user_id, to_phone) = match target {
            Target::User(id) => (Some(id.clone()), None),
            Target::Phone(phone) => (None, Some(phone.clone())),
        };
        Self {
            request_id,
            to_user_id,
            to_phone,
            message,
        }
    }

    /// Resolve the addressing fields, rejecting frames that set both or neither.
    pub fn target(&self) -> RelayResult<Target> {
        match (&self.to_user_id, &self.to_phone) {
            (Some(id), None) if !id.is_empty() => Ok(Target::User(id.clone())),
            (None, Some(phone)) if !phone.is_empty() => Ok(Target::Phone(phone.clone())),
            (Some(_), Some(_)) => Err(RelayError::InvalidMessage(
                "toUserId and toPhone are mutually exclusive".into(),
            )),
            _ => Err(RelayError::InvalidMessage(
                "direct-message needs toUserId or toPhone".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity block attached by the relay to a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddress {
    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// A peer message delivered by the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerAddress>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    // Flat sender fields used by older relays.
    #[serde(default, alias = "sender_id", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, alias = "sender_phone", skip_serializing_if = "Option::is_none")]
    pub sender_phone: Option<String>,
    #[serde(default, alias = "sender_username", skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
}

impl ConsoleMessage {
    pub fn sender_user_id(&self) -> Option<&str> {
        self.from
            .as_ref()
            .and_then(|f| f.user_id.as_deref())
            .or(self.sender_id.as_deref())
    }

    pub fn sender_phone(&self) -> Option<&str> {
        self.from
            .as_ref()
            .and_then(|f| f.phone.as_deref())
            .or(self.sender_phone.as_deref())
    }

    pub fn sender_username(&self) -> Option<&str> {
        self.from
            .as_ref()
            .and_then(|f| f.username.as_deref())
            .or(self.sender_username.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityViolation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

/// Milliseconds since the Unix epoch, for relay-stamped timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
