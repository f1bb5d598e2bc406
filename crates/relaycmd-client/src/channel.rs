//! The relay channel.
//!
//! `Channel` owns one logical connection to the relay: it opens a transport,
//! runs the auth handshake, keeps the link alive with pings, routes inbound
//! frames (pending responses first, then command dispatch), and reconnects once
//! after an unexpected close.
//!
//! Lifecycle state lives behind one mutex and is never held across an await.
//! Every connection attempt gets a fresh generation number; background tasks
//! carry the generation they were started for and go quiet as soon as it is
//! stale, which is how `stop()` detaches the close handler.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use relaycmd_core::{
    decode_frame, encode_frame, CommandEnvelope, DirectMessage, Frame, Params, RelayError, Target,
};

use crate::auth;
use crate::config::ChannelConfig;
use crate::correlator::PendingRequests;
use crate::credentials::CredentialProvider;
use crate::dispatcher::Dispatcher;
use crate::gate::SenderGate;
use crate::registry::{CommandRegistry, HandlerResult, SenderInfo};
use crate::transport::{Connector, TransportEvent, TransportLink};

/// Request id prefix for outbound commands.
pub const COMMAND_PREFIX: &str = "rc_cmd";

/// Where the channel is in its connection lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    /// Transport open, handshake in flight.
    Connected,
    Authenticated,
}

/// Result of [`Channel::send_command`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub success: bool,
    pub delivered: bool,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Session {
    state: LinkState,
    /// Set by `start()`, cleared by `stop()`. Gates reconnection.
    running: bool,
    generation: u64,
    /// Identity pinned by the caller; re-sent as `registerAs` on reconnect.
    pinned: Option<String>,
    /// Resolved identity used for loop prevention.
    identity: Option<String>,
    outgoing: Option<mpsc::Sender<String>>,
    close: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Session {
    fn teardown_link(&mut self) {
        self.outgoing = None;
        self.close = None;
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }
}

struct Inner<C> {
    connector: C,
    credentials: Arc<dyn CredentialProvider>,
    config: ChannelConfig,
    pending: PendingRequests,
    dispatcher: Dispatcher,
    session: Mutex<Session>,
}

/// A persistent, authenticated command channel to a relay.
pub struct Channel<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Channel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle to a [`Channel`], for handlers that talk back to it.
pub struct WeakChannel<C: Connector> {
    inner: Weak<Inner<C>>,
}

impl<C: Connector> Clone for WeakChannel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> WeakChannel<C> {
    pub fn upgrade(&self) -> Option<Channel<C>> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl<C: Connector> Channel<C> {
    pub fn new(
        connector: C,
        credentials: impl CredentialProvider,
        config: ChannelConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            CommandRegistry::new(),
            SenderGate::new(),
            config.dedup_window,
        );
        Self {
            inner: Arc::new(Inner {
                connector,
                credentials: Arc::new(credentials),
                config,
                pending: PendingRequests::new(),
                dispatcher,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakChannel<C> {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.inner.dispatcher.registry()
    }

    /// Register a command handler, replacing any previous one under `name`.
    /// Returns `true` if a handler was replaced.
    pub fn register<F>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Params, &SenderInfo) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry().register(name, handler)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.registry().unregister(name)
    }

    /// Replace the allow-list. Empty allows every sender.
    pub fn set_allowed_senders<I, S>(&self, user_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.dispatcher.gate().set_allowed_senders(user_ids);
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// Whether the channel is connected and authenticated.
    pub fn is_active(&self) -> bool {
        self.state() == LinkState::Authenticated
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.inner.lock().identity.clone()
    }

    /// Connect and authenticate. Returns whether authentication succeeded.
    ///
    /// Does nothing and returns `true` if the channel is already connecting or
    /// connected. Returns `false` without touching the network when no token
    /// is available.
    pub async fn start(&self, identity: Option<String>) -> bool {
        let (generation, token) = {
            let mut session = self.inner.lock();
            if session.state != LinkState::Idle {
                debug!(state = ?session.state, "start ignored, channel already up");
                return true;
            }

            let Some(token) = self.inner.credentials.token() else {
                warn!("no bearer token available, not connecting");
                return false;
            };

            if let Some(handle) = session.reconnect.take() {
                handle.abort();
            }
            session.running = true;
            session.pinned = identity.clone();
            session.identity = identity;
            session.generation += 1;
            session.state = LinkState::Connecting;
            (session.generation, token)
        };

        self.inner.clone().connect(generation, token).await
    }

    /// Cancel timers, close the transport without triggering a reconnect, and
    /// clear session state. Outstanding requests are left to time out.
    pub fn stop(&self) {
        let mut session = self.inner.lock();
        session.generation += 1;
        session.running = false;
        for handle in [
            session.reconnect.take(),
            session.keepalive.take(),
            session.driver.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        session.teardown_link();
        session.pinned = None;
        session.identity = None;
        session.state = LinkState::Idle;
        info!("channel stopped");
    }

    /// Send `{command, params}` to another peer and wait for the relay's
    /// acknowledgment.
    pub async fn send_command(
        &self,
        target: Target,
        command: impl Into<String>,
        params: Params,
    ) -> SendOutcome {
        let outgoing = {
            let session = self.inner.lock();
            match (&session.state, &session.outgoing) {
                (LinkState::Authenticated, Some(outgoing)) => outgoing.clone(),
                _ => return SendOutcome::failed("not_connected"),
            }
        };

        let command = command.into();
        let message = match CommandEnvelope::new(command.clone(), params).to_json_string() {
            Ok(message) => message,
            Err(e) => return SendOutcome::failed(e.to_string()),
        };

        debug!(command = %command, to = %target, "sending command");
        let response = self
            .inner
            .pending
            .send_correlated(
                COMMAND_PREFIX,
                outgoing,
                move |request_id| Frame::DirectMessage(DirectMessage::new(request_id, &target, message)),
                |frame| {
                    matches!(
                        frame,
                        Frame::DirectMessageResponse(_) | Frame::SecurityViolation(_)
                    )
                },
                self.inner.config.command_timeout,
            )
            .await;

        match response {
            Ok(Frame::DirectMessageResponse(ack)) => SendOutcome {
                success: ack.success,
                delivered: ack.delivered.unwrap_or(false),
                queued: ack.queued.unwrap_or(false),
                error: ack.error,
            },
            Ok(Frame::SecurityViolation(violation)) => {
                warn!(command = %command, code = %violation.code, "relay rejected command");
                SendOutcome::failed("security_violation")
            }
            Ok(other) => SendOutcome::failed(format!("unexpected response: {}", other.kind())),
            Err(RelayError::Timeout) => {
                warn!(command = %command, "command timed out");
                SendOutcome::failed("timeout")
            }
            Err(RelayError::NotConnected) => SendOutcome::failed("not_connected"),
            Err(e) => SendOutcome::failed(e.to_string()),
        }
    }
}

impl<C: Connector> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a transport, start its driver, and authenticate on it.
    async fn connect(self: Arc<Self>, generation: u64, token: String) -> bool {
        let opened = time::timeout(self.config.connect_timeout, self.connector.connect()).await;
        let link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to open relay transport");
                self.link_failed(generation);
                return false;
            }
            Err(_) => {
                warn!(timeout = ?self.config.connect_timeout, "relay transport open timed out");
                self.link_failed(generation);
                return false;
            }
        };

        let TransportLink { outgoing, incoming } = link;
        let (close_tx, close_rx) = oneshot::channel();
        let (down_tx, down_rx) = oneshot::channel::<()>();

        let pinned = {
            let mut session = self.lock();
            if session.generation != generation {
                debug!("channel stopped while connecting");
                return false;
            }
            session.state = LinkState::Connected;
            session.outgoing = Some(outgoing.clone());
            session.close = Some(close_tx);
            session.driver = Some(tokio::spawn(drive(
                Arc::downgrade(&self),
                generation,
                incoming,
                close_rx,
                down_tx,
            )));
            session.pinned.clone()
        };
        debug!("relay transport open, authenticating");

        let handshake = auth::handshake(
            &self.pending,
            outgoing,
            token,
            pinned,
            self.config.auth_timeout,
        );
        let result = tokio::select! {
            result = handshake => result,
            _ = down_rx => Err(RelayError::Transport("closed during handshake".into())),
        };

        let mut session = self.lock();
        if session.generation != generation {
            return false;
        }
        match result {
            Ok(auth) => {
                session.state = LinkState::Authenticated;
                session.identity = Some(auth.identity);
                if !self.config.keepalive_interval.is_zero() {
                    session.keepalive = Some(tokio::spawn(keepalive(
                        Arc::downgrade(&self),
                        generation,
                        self.config.keepalive_interval,
                    )));
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "relay handshake failed");
                // Closing the link hands reconnection to the close path.
                if let Some(close) = session.close.take() {
                    let _ = close.send(());
                }
                false
            }
        }
    }

    /// The transport never opened for this attempt.
    fn link_failed(self: &Arc<Self>, generation: u64) {
        let mut session = self.lock();
        if session.generation != generation {
            return;
        }
        session.state = LinkState::Idle;
        if session.running {
            self.schedule_reconnect(&mut session);
        }
    }

    /// The transport of `generation` closed.
    fn on_closed(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        let mut session = self.lock();
        if session.generation != generation {
            return;
        }
        if session.state != LinkState::Idle {
            warn!(reason = reason.as_deref().unwrap_or("none"), "relay connection closed");
        }
        session.state = LinkState::Idle;
        session.driver = None;
        session.teardown_link();
        if session.running {
            self.schedule_reconnect(&mut session);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, session: &mut Session) {
        if session.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("reconnect already scheduled");
            return;
        }
        let delay = self.config.reconnect_delay;
        info!(delay = ?delay, "scheduling reconnect");
        let weak = Arc::downgrade(self);
        session.reconnect = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect().await;
            }
        }));
    }

    async fn reconnect(self: Arc<Self>) {
        let (generation, token) = {
            let mut session = self.lock();
            // Detach our own handle so a failure here can schedule the next attempt.
            session.reconnect = None;
            if !session.running || session.state != LinkState::Idle {
                return;
            }
            let Some(token) = self.credentials.token() else {
                warn!("no bearer token available, giving up reconnect");
                return;
            };
            session.generation += 1;
            session.state = LinkState::Connecting;
            (session.generation, token)
        };

        info!("reconnecting to relay");
        if self.clone().connect(generation, token).await {
            info!("reconnected to relay");
        }
    }

    fn route_frame(&self, generation: u64, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        if self.pending.resolve(&frame) {
            return;
        }

        match frame {
            Frame::ConsoleMessage(message) => {
                let identity = self.lock().identity.clone();
                let outcome = self.dispatcher.dispatch(&message, identity.as_deref());
                trace!(outcome = ?outcome, "dispatched console-message");
            }
            Frame::Ping => self.reply(generation, &Frame::Pong),
            Frame::Pong => trace!("keepalive pong"),
            Frame::SecurityViolation(violation) => {
                warn!(code = %violation.code, message = %violation.message, "security violation reported by relay");
            }
            other if other.is_management() => {
                debug!(kind = other.kind(), request_id = ?other.request_id(), "no pending request for response");
            }
            other => debug!(kind = other.kind(), "ignoring frame"),
        }
    }

    fn reply(&self, generation: u64, frame: &Frame) {
        let outgoing = {
            let session = self.lock();
            if session.generation != generation {
                return;
            }
            session.outgoing.clone()
        };
        let Some(outgoing) = outgoing else { return };
        match encode_frame(frame) {
            Ok(text) => {
                if outgoing.try_send(text).is_err() {
                    warn!(kind = frame.kind(), "could not queue reply");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode reply"),
        }
    }
}

/// Reads one transport until it closes or the channel closes it.
async fn drive<C: Connector>(
    inner: Weak<Inner<C>>,
    generation: u64,
    mut incoming: mpsc::Receiver<TransportEvent>,
    mut close_rx: oneshot::Receiver<()>,
    _down: oneshot::Sender<()>,
) {
    let reason = loop {
        tokio::select! {
            _ = &mut close_rx => break Some("closed by channel".to_string()),
            event = incoming.recv() => match event {
                Some(TransportEvent::Frame(text)) => {
                    let Some(inner) = inner.upgrade() else { return };
                    inner.route_frame(generation, &text);
                }
                Some(TransportEvent::Closed(reason)) => break reason,
                None => break None,
            },
        }
    };
    drop(incoming);

    if let Some(inner) = inner.upgrade() {
        inner.on_closed(generation, reason);
    }
    trace!("driver ended");
}

async fn keepalive<C: Connector>(inner: Weak<Inner<C>>, generation: u64, period: time::Duration) {
    let mut ticker = time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let outgoing = {
            let Some(inner) = inner.upgrade() else { break };
            let session = inner.lock();
            if session.generation != generation {
                break;
            }
            session.outgoing.clone()
        };
        let Some(outgoing) = outgoing else { break };
        let Ok(ping) = encode_frame(&Frame::Ping) else { break };
        if outgoing.send(ping).await.is_err() {
            break;
        }
        trace!("keepalive ping");
    }
    debug!("keepalive loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relaycmd_core::{
        AuthResponse, ConsoleMessage, DirectMessageResponse, PeerAddress, SecurityViolation,
    };
    use serde_json::{json, Value};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::Instant;

    use crate::credentials::StaticToken;
    use crate::registry::HandlerError;
    use crate::transport::{MemoryConnector, MemoryPeer};

    type Peers = UnboundedReceiver<MemoryPeer>;

    fn channel_with(token: Option<&str>) -> (Channel<MemoryConnector>, MemoryConnector, Peers) {
        let (connector, peers) = MemoryConnector::new();
        let credentials = match token {
            Some(t) => StaticToken::new(t),
            None => StaticToken::none(),
        };
        let channel = Channel::new(connector.clone(), credentials, ChannelConfig::default());
        (channel, connector, peers)
    }

    async fn answer_auth(peer: &mut MemoryPeer, user_id: &str) -> Value {
        let auth = peer.recv_value().await.expect("auth frame");
        assert_eq!(auth["type"], "auth");
        peer.send_frame(&Frame::AuthResponse(AuthResponse {
            request_id: auth["requestId"].as_str().unwrap().to_string(),
            success: true,
            user: Some(json!({"id": user_id})),
            error: None,
        }))
        .await
        .unwrap();
        auth
    }

    async fn start_as(
        channel: &Channel<MemoryConnector>,
        peers: &mut Peers,
        identity: Option<&str>,
    ) -> MemoryPeer {
        let task = {
            let channel = channel.clone();
            let identity = identity.map(str::to_string);
            tokio::spawn(async move { channel.start(identity).await })
        };
        let mut peer = peers.recv().await.expect("connection attempt");
        answer_auth(&mut peer, "u1").await;
        assert!(task.await.unwrap());
        peer
    }

    fn console(from: &str, text: &str) -> Frame {
        Frame::ConsoleMessage(ConsoleMessage {
            from: Some(PeerAddress {
                user_id: Some(from.to_string()),
                ..Default::default()
            }),
            message: text.to_string(),
            timestamp: Some(json!(1_700_000_000_000u64)),
            ..Default::default()
        })
    }

    fn notify(tx: UnboundedSender<(String, Params, SenderInfo)>, name: &'static str) -> impl Fn(&Params, &SenderInfo) -> HandlerResult + Send + Sync + 'static {
        move |params: &Params, sender: &SenderInfo| {
            let _ = tx.send((name.to_string(), params.clone(), sender.clone()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_token_opens_nothing() {
        let (channel, connector, _peers) = channel_with(None);
        assert!(!channel.start(Some("u1".into())).await);
        assert_eq!(connector.attempts(), 0);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 0);
        assert_eq!(channel.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn start_authenticates_and_is_idempotent() {
        let (channel, connector, mut peers) = channel_with(Some("tok"));
        let _peer = start_as(&channel, &mut peers, None).await;

        assert!(channel.is_active());
        assert_eq!(channel.current_user_id().as_deref(), Some("u1"));

        assert!(channel.start(Some("other".into())).await);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(channel.current_user_id().as_deref(), Some("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_identity_sent_as_register_as() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.start(Some("actor-7".into())).await })
        };
        let mut peer = peers.recv().await.unwrap();
        let auth = answer_auth(&mut peer, "u1").await;
        assert!(task.await.unwrap());

        assert_eq!(auth["registerAs"], "actor-7");
        assert_eq!(auth["token"], "tok");
        assert_eq!(channel.current_user_id().as_deref(), Some("actor-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_peer_command_and_skips_self() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let (tx, mut calls) = unbounded_channel();
        channel.register("ping", notify(tx.clone(), "ping"));
        channel.register("mark", notify(tx, "mark"));
        let peer = start_as(&channel, &mut peers, Some("u1")).await;

        peer.send_frame(&console("u2", r#"{"command":"ping","params":{}}"#))
            .await
            .unwrap();
        let (name, params, sender) = calls.recv().await.unwrap();
        assert_eq!(name, "ping");
        assert!(params.is_empty());
        assert_eq!(sender.user_id.as_deref(), Some("u2"));

        peer.send_frame(&console("u1", r#"{"command":"ping","params":{}}"#))
            .await
            .unwrap();
        peer.send_frame(&console("u2", r#"{"command":"mark"}"#))
            .await
            .unwrap();
        let (name, _, _) = calls.recv().await.unwrap();
        assert_eq!(name, "mark");
    }

    #[tokio::test(start_paused = true)]
    async fn allow_list_drops_other_senders() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let (tx, mut calls) = unbounded_channel();
        channel.register("ping", notify(tx, "ping"));
        channel.set_allowed_senders(["A"]);
        let peer = start_as(&channel, &mut peers, None).await;

        peer.send_frame(&console("B", r#"{"command":"ping","params":{"n":1}}"#))
            .await
            .unwrap();
        peer.send_frame(&console("A", r#"{"command":"ping","params":{"n":2}}"#))
            .await
            .unwrap();
        let (_, params, sender) = calls.recv().await.unwrap();
        assert_eq!(sender.user_id.as_deref(), Some("A"));
        assert_eq!(params.get("n"), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_does_not_disturb_channel() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let (tx, mut calls) = unbounded_channel();
        channel.register("explode", |_: &Params, _: &SenderInfo| -> HandlerResult {
            panic!("handler bug")
        });
        channel.register("fail", |_: &Params, _: &SenderInfo| {
            Err(HandlerError::Failed("nope".into()))
        });
        channel.register("ok", notify(tx, "ok"));
        let peer = start_as(&channel, &mut peers, None).await;

        for text in [
            r#"{"command":"explode"}"#,
            r#"{"command":"fail"}"#,
            "just chatting",
            r#"{"command":"unknown"}"#,
            r#"{"command":"ok"}"#,
        ] {
            peer.send_frame(&console("u2", text)).await.unwrap();
        }
        let (name, _, _) = calls.recv().await.unwrap();
        assert_eq!(name, "ok");
        assert!(channel.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn answers_relay_ping() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let mut peer = start_as(&channel, &mut peers, None).await;
        peer.send_frame(&Frame::Ping).await.unwrap();
        assert_eq!(peer.recv_frame().await, Some(Frame::Pong));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_on_interval() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let mut peer = start_as(&channel, &mut peers, None).await;
        let started = Instant::now();

        assert_eq!(peer.recv_frame().await, Some(Frame::Ping));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(peer.recv_frame().await, Some(Frame::Ping));
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn send_command_requires_authentication() {
        let (channel, connector, _peers) = channel_with(Some("tok"));
        let outcome = channel
            .send_command(Target::User("u2".into()), "ping", Params::new())
            .await;
        assert_eq!(outcome, SendOutcome::failed("not_connected"));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_command_round_trip() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let mut peer = start_as(&channel, &mut peers, None).await;

        let task = {
            let channel = channel.clone();
            let mut params = Params::new();
            params.insert("timestamp".into(), json!(5));
            tokio::spawn(async move {
                channel
                    .send_command(Target::Phone("+33600000000".into()), "ping", params)
                    .await
            })
        };

        let sent = peer.recv_value().await.unwrap();
        assert_eq!(sent["type"], "direct-message");
        assert_eq!(sent["toPhone"], "+33600000000");
        assert!(sent.get("toUserId").is_none());
        assert!(sent["requestId"].as_str().unwrap().starts_with("rc_cmd_"));
        let envelope = CommandEnvelope::parse(sent["message"].as_str().unwrap()).unwrap();
        assert_eq!(envelope.command, "ping");
        assert_eq!(envelope.params.get("timestamp"), Some(&json!(5)));

        peer.send_frame(&Frame::DirectMessageResponse(DirectMessageResponse {
            request_id: sent["requestId"].as_str().unwrap().to_string(),
            success: true,
            delivered: Some(false),
            queued: Some(true),
            error: None,
        }))
        .await
        .unwrap();

        let outcome = task.await.unwrap();
        assert!(outcome.success);
        assert!(outcome.queued);
        assert!(!outcome.delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn send_command_times_out() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let mut peer = start_as(&channel, &mut peers, None).await;

        let started = Instant::now();
        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_command(Target::User("u2".into()), "ping", Params::new())
                    .await
            })
        };
        assert_eq!(peer.recv_value().await.unwrap()["type"], "direct-message");

        let outcome = task.await.unwrap();
        assert_eq!(outcome, SendOutcome::failed("timeout"));
        assert!(started.elapsed() >= Duration::from_secs(8));
        assert!(channel.inner.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_command_security_violation() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let mut peer = start_as(&channel, &mut peers, None).await;

        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_command(Target::User("u2".into()), "ping", Params::new())
                    .await
            })
        };
        let sent = peer.recv_value().await.unwrap();
        peer.send_frame(&Frame::SecurityViolation(SecurityViolation {
            request_id: Some(sent["requestId"].as_str().unwrap().to_string()),
            code: "INJECTION_DETECTED".into(),
            message: "blocked".into(),
            timestamp: None,
        }))
        .await
        .unwrap();

        assert_eq!(task.await.unwrap(), SendOutcome::failed("security_violation"));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reconnects_once_after_delay() {
        let (channel, connector, mut peers) = channel_with(Some("tok"));
        let peer = start_as(&channel, &mut peers, Some("u1")).await;

        let closed_at = Instant::now();
        peer.close().await;

        let mut next = peers.recv().await.expect("reconnect attempt");
        assert!(closed_at.elapsed() >= Duration::from_secs(5));
        assert_eq!(connector.attempts(), 2);

        let auth = answer_auth(&mut next, "u1").await;
        assert_eq!(auth["registerAs"], "u1");
        time::sleep(Duration::from_millis(10)).await;
        assert!(channel.is_active());

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_close_schedules_one_reconnect() {
        let (channel, connector, mut peers) = channel_with(Some("tok"));
        let _peer = start_as(&channel, &mut peers, None).await;

        let generation = channel.inner.lock().generation;
        channel.inner.on_closed(generation, Some("first".into()));
        channel.inner.on_closed(generation, Some("second".into()));
        assert_eq!(channel.state(), LinkState::Idle);
        assert!(!channel.is_active());

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_reconnect() {
        let (channel, connector, mut peers) = channel_with(Some("tok"));
        let mut peer = start_as(&channel, &mut peers, Some("u1")).await;

        channel.stop();
        assert_eq!(channel.state(), LinkState::Idle);
        assert_eq!(channel.current_user_id(), None);

        assert_eq!(peer.recv_text().await, None);
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(peer.is_closed_by_channel());

        channel.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let (channel, connector, mut peers) = channel_with(Some("tok"));
        let peer = start_as(&channel, &mut peers, None).await;

        peer.close().await;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(channel.state(), LinkState::Idle);

        channel.stop();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_auth_fails_then_retries() {
        let (channel, connector, mut peers) = channel_with(Some("tok"));
        let task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.start(None).await })
        };

        let mut peer = peers.recv().await.unwrap();
        let auth = peer.recv_value().await.unwrap();
        peer.send_frame(&Frame::AuthResponse(AuthResponse {
            request_id: auth["requestId"].as_str().unwrap().to_string(),
            success: false,
            user: None,
            error: Some("invalid token".into()),
        }))
        .await
        .unwrap();

        assert!(!task.await.unwrap());
        assert!(!channel.is_active());
        assert_eq!(peer.recv_text().await, None);

        let _retry = peers.recv().await.expect("reconnect after failed auth");
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_timeout_fails_start() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.start(None).await })
        };
        let mut peer = peers.recv().await.unwrap();
        let started = Instant::now();
        assert_eq!(peer.recv_value().await.unwrap()["type"], "auth");

        assert!(!task.await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_handshake_fails_start() {
        let (channel, _connector, mut peers) = channel_with(Some("tok"));
        let task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.start(None).await })
        };
        let mut peer = peers.recv().await.unwrap();
        let started = Instant::now();
        peer.recv_value().await.unwrap();
        peer.close().await;

        assert!(!task.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_transport_fails_and_retries() {
        let (channel, connector, mut peers) = channel_with(Some("tok"));
        connector.set_refuse(true);
        assert!(!channel.start(None).await);
        assert_eq!(connector.attempts(), 1);

        connector.set_refuse(false);
        let mut peer = peers.recv().await.expect("retry after refused open");
        answer_auth(&mut peer, "u1").await;
        time::sleep(Duration::from_millis(10)).await;
        assert!(channel.is_active());
    }
}
