//! The relay: authenticates connections and routes direct messages.
//!
//! Every inbound frame of one connection goes through [`Relay::handle_text`],
//! which returns the frames to send back on that same connection. Deliveries to
//! other users go out through their registered senders.
//!
//! A `direct-message` is processed strictly as: authentication, authorization
//! (addressing resolves to a known user), injection screen, delivery.

pub mod queue;
pub mod registry;

pub use queue::OfflineQueue;
pub use registry::{ConnectionEntry, ConnectionRegistry};

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use relaycmd_core::{
    decode_frame_limited, encode_frame, find_injection, unix_millis, AuthRequest, AuthResponse,
    ConsoleMessage, DirectMessage, DirectMessageResponse, Frame, PeerAddress, SecurityViolation,
    Target, INJECTION_CODE,
};

use crate::auth::{AuthRateLimit, UserDirectory};
use crate::config::ServerConfig;

/// Identity bound to a connection after a successful `auth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    /// Routing identity: the token's user id, or an actor bound to the token
    /// and pinned with `registerAs`.
    pub user_id: String,
    pub username: Option<String>,
    pub phone: Option<String>,
}

/// Per-connection state owned by the connection task.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: u64,
    pub remote_ip: IpAddr,
    sender: mpsc::Sender<String>,
    pub user: Option<SessionUser>,
}

pub struct Relay {
    users: UserDirectory,
    connections: ConnectionRegistry,
    queue: Mutex<OfflineQueue>,
    rate_limit: Mutex<AuthRateLimit>,
    max_frame_bytes: usize,
    next_connection_id: AtomicU64,
}

impl Relay {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            users: UserDirectory::new(&config.users),
            connections: ConnectionRegistry::new(),
            queue: Mutex::new(OfflineQueue::new(config.queue_limit)),
            rate_limit: Mutex::new(AuthRateLimit::default()),
            max_frame_bytes: config.max_frame_bytes,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// State for a newly accepted connection. `sender` receives deliveries.
    pub fn open(&self, remote_ip: IpAddr, sender: mpsc::Sender<String>) -> ConnectionState {
        ConnectionState {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            remote_ip,
            sender,
            user: None,
        }
    }

    pub async fn close(&self, conn: &ConnectionState) {
        self.connections.unregister(conn.id).await;
    }

    pub async fn gc(&self) {
        self.rate_limit.lock().await.gc();
    }

    /// Process one inbound text frame; returns the replies for this connection.
    pub async fn handle_text(&self, conn: &mut ConnectionState, text: &str) -> Vec<Frame> {
        let frame = match decode_frame_limited(text, self.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = conn.id, error = %e, "dropping inbound frame");
                return Vec::new();
            }
        };

        match frame {
            Frame::Ping => vec![Frame::Pong],
            Frame::Auth(request) => self.handle_auth(conn, request).await,
            Frame::DirectMessage(message) => vec![self.handle_direct_message(conn, message).await],
            other => {
                debug!(connection_id = conn.id, kind = other.kind(), "ignoring frame");
                Vec::new()
            }
        }
    }

    async fn handle_auth(&self, conn: &mut ConnectionState, request: AuthRequest) -> Vec<Frame> {
        let fail = |error: &str| {
            vec![Frame::AuthResponse(AuthResponse {
                request_id: request.request_id.clone(),
                success: false,
                user: None,
                error: Some(error.to_string()),
            })]
        };

        if !self.rate_limit.lock().await.check(&conn.remote_ip) {
            warn!(remote = %conn.remote_ip, "auth rate limited");
            return fail("rate_limited");
        }
        if request.action != "me" {
            return fail("unsupported_action");
        }
        let Some(record) = self.users.authenticate(&request.token) else {
            warn!(remote = %conn.remote_ip, "auth with unknown token");
            return fail("invalid_token");
        };

        let pinned = request
            .register_as
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let user_id = match pinned {
            None => record.user_id.clone(),
            Some(id) if record.may_act_as(id) => id.to_string(),
            Some(id) => {
                warn!(
                    remote = %conn.remote_ip,
                    token_user = %record.user_id,
                    requested = %id,
                    "registerAs not bound to token"
                );
                return fail("forbidden_identity");
            }
        };
        let user = SessionUser {
            user_id: user_id.clone(),
            username: record.username.clone(),
            phone: record.phone.clone(),
        };

        self.connections
            .register(conn.id, user_id.clone(), conn.sender.clone())
            .await;
        info!(
            user = %user_id,
            token_user = %record.user_id,
            connection_id = conn.id,
            "connection authenticated"
        );

        let mut replies = vec![Frame::AuthResponse(AuthResponse {
            request_id: request.request_id,
            success: true,
            user: Some(json!({
                "userId": user.user_id,
                "username": user.username,
                "phone": user.phone,
            })),
            error: None,
        })];
        conn.user = Some(user);

        let queued = self.queue.lock().await.drain(&user_id);
        if !queued.is_empty() {
            info!(user = %user_id, count = queued.len(), "flushing offline queue");
        }
        replies.extend(queued.into_iter().map(Frame::ConsoleMessage));
        replies
    }

    async fn handle_direct_message(&self, conn: &ConnectionState, message: DirectMessage) -> Frame {
        let request_id = message.request_id.clone();
        let reply = |error: &str| {
            Frame::DirectMessageResponse(DirectMessageResponse {
                request_id: request_id.clone(),
                success: false,
                error: Some(error.to_string()),
                ..Default::default()
            })
        };

        // Authentication.
        let Some(sender) = conn.user.as_ref() else {
            return reply("not_authenticated");
        };

        // Authorization.
        let target_id = match message.target() {
            Ok(Target::User(id)) => {
                if self.users.get(&id).is_none() && !self.connections.is_online(&id).await {
                    return reply("unknown_recipient");
                }
                id
            }
            Ok(Target::Phone(phone)) => match self.users.by_phone(&phone) {
                Some(record) => record.user_id.clone(),
                None => return reply("unknown_recipient"),
            },
            Err(e) => {
                debug!(error = %e, "bad direct-message addressing");
                return reply("invalid_target");
            }
        };

        // Security screen over the whole frame.
        let value = serde_json::to_value(&message).unwrap_or_default();
        if let Some(pattern) = find_injection(&value) {
            warn!(user = %sender.user_id, pattern, "injection pattern in direct-message");
            return Frame::SecurityViolation(SecurityViolation {
                request_id: Some(request_id.clone()),
                code: INJECTION_CODE.to_string(),
                message: "Potential injection attempt detected".to_string(),
                timestamp: Some(json!(unix_millis())),
            });
        }

        // Delivery.
        let delivery = ConsoleMessage {
            from: Some(PeerAddress {
                user_id: Some(sender.user_id.clone()),
                phone: sender.phone.clone(),
                username: sender.username.clone(),
            }),
            to: Some(PeerAddress {
                user_id: Some(target_id.clone()),
                ..Default::default()
            }),
            message: message.message,
            timestamp: Some(json!(unix_millis())),
            ..Default::default()
        };

        let delivered = self.deliver(&target_id, conn.id, &delivery).await;
        let queued = if delivered {
            false
        } else {
            self.queue.lock().await.push(&target_id, delivery);
            true
        };
        debug!(from = %sender.user_id, to = %target_id, delivered, queued, "direct-message routed");

        Frame::DirectMessageResponse(DirectMessageResponse {
            request_id,
            success: true,
            delivered: Some(delivered),
            queued: Some(queued),
            error: None,
        })
    }

    /// Push to every live connection of `user_id` except the sender's.
    ///
    /// Never waits on a recipient: a connection whose outbound buffer is full
    /// does not count as delivered.
    async fn deliver(&self, user_id: &str, from_connection: u64, message: &ConsoleMessage) -> bool {
        let text = match encode_frame(&Frame::ConsoleMessage(message.clone())) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode delivery");
                return false;
            }
        };

        let mut delivered = false;
        for entry in self.connections.connections_of(user_id, Some(from_connection)).await {
            match entry.sender.try_send(text.clone()) {
                Ok(()) => delivered = true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        user = %user_id,
                        connection_id = entry.connection_id,
                        "outbound buffer full, skipping connection"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}
