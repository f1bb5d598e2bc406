//! Auth handshake run once per transport, right after it opens.
//!
//! Sends `auth`/`me` with the bearer token and an optional pinned identity,
//! then waits for the matching `auth-response` through the correlator.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use relaycmd_core::{AuthRequest, Frame, RelayError, RelayResult};

use crate::correlator::PendingRequests;

/// Request id prefix for handshakes.
pub const AUTH_PREFIX: &str = "rc_auth";

/// The identity a successful handshake produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    /// Identity used for routing and loop prevention.
    pub identity: String,
    /// What the relay resolved for the token, if it said.
    pub server_user_id: Option<String>,
    pub username: Option<String>,
}

/// Pick the session identity: a pinned identity always wins. A disagreement
/// with the relay is logged, not treated as a failure.
pub fn resolve_identity(pinned: Option<&str>, server: Option<&str>) -> Option<String> {
    match (pinned, server) {
        (Some(pinned), Some(server)) if pinned != server => {
            warn!(
                pinned = %pinned,
                server = %server,
                "relay resolved a different identity; keeping pinned identity"
            );
            Some(pinned.to_string())
        }
        (Some(pinned), _) => Some(pinned.to_string()),
        (None, server) => server.map(str::to_string),
    }
}

pub async fn handshake(
    pending: &PendingRequests,
    outgoing: mpsc::Sender<String>,
    token: String,
    register_as: Option<String>,
    timeout: Duration,
) -> RelayResult<AuthSession> {
    let pinned = register_as.clone();
    let response = pending
        .send_correlated(
            AUTH_PREFIX,
            outgoing,
            move |request_id| Frame::Auth(AuthRequest::me(request_id, token, register_as)),
            |frame| matches!(frame, Frame::AuthResponse(_)),
            timeout,
        )
        .await?;

    let Frame::AuthResponse(response) = response else {
        return Err(RelayError::InvalidMessage("expected auth-response".into()));
    };

    if !response.success {
        let reason = response.error.unwrap_or_else(|| "auth rejected".to_string());
        warn!(reason = %reason, "relay rejected token");
        return Err(RelayError::AuthFailed(reason));
    }

    let server_user_id = response.user_id();
    let identity = resolve_identity(pinned.as_deref(), server_user_id.as_deref())
        .ok_or_else(|| RelayError::AuthFailed("relay returned no user id".into()))?;

    info!(identity = %identity, "authenticated with relay");
    Ok(AuthSession {
        identity,
        server_user_id,
        username: response.username(),
    })
}
