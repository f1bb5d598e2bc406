//! Outbound correlator: send a tagged request, await the matching response.
//!
//! All in-flight requests live in one [`PendingRequests`] table keyed by
//! `requestId`. The inbound router offers every decoded frame to
//! [`PendingRequests::resolve`] before anything else. An entry leaves the table
//! exactly once: either `resolve` removes it on a match, or the waiting side
//! removes it when its deadline passes (or when the waiting future is dropped).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::trace;

use relaycmd_core::{encode_frame, Frame, RelayError, RelayResult};

/// Predicate a response frame must satisfy, on top of carrying the request id.
pub type FrameMatcher = Box<dyn Fn(&Frame) -> bool + Send>;

struct Pending {
    matcher: FrameMatcher,
    reply: oneshot::Sender<Frame>,
}

/// Table of requests awaiting a response.
#[derive(Clone, Default)]
pub struct PendingRequests {
    table: Arc<Mutex<HashMap<String, Pending>>>,
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Fresh request id: `<prefix>_<sequence>_<random>`.
pub fn next_request_id(prefix: &str) -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{seq}_{:08x}", rand::random::<u32>())
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand `frame` to the request it answers. Returns `true` if consumed.
    pub fn resolve(&self, frame: &Frame) -> bool {
        let Some(request_id) = frame.request_id() else {
            return false;
        };

        let pending = {
            let mut table = self.lock();
            let matched = table
                .get(request_id)
                .is_some_and(|pending| (pending.matcher)(frame));
            if !matched {
                return false;
            }
            table.remove(request_id)
        };

        match pending {
            Some(pending) => {
                trace!(request_id, kind = frame.kind(), "resolved pending request");
                let _ = pending.reply.send(frame.clone());
                true
            }
            None => false,
        }
    }

    fn insert(&self, request_id: String, pending: Pending) -> PendingGuard {
        self.lock().insert(request_id.clone(), pending);
        PendingGuard {
            table: self.clone(),
            request_id,
        }
    }

    /// Build a frame around a fresh request id, send it, and wait for a
    /// response carrying that id and satisfying `matcher`.
    ///
    /// The deadline covers queueing the frame as well as the wait for the
    /// response. The sender is consumed and dropped as soon as the frame is
    /// queued, so an outstanding request never keeps a transport open.
    pub async fn send_correlated<B, M>(
        &self,
        prefix: &str,
        outgoing: mpsc::Sender<String>,
        build: B,
        matcher: M,
        timeout: Duration,
    ) -> RelayResult<Frame>
    where
        B: FnOnce(String) -> Frame + Send,
        M: Fn(&Frame) -> bool + Send + 'static,
    {
        let request_id = next_request_id(prefix);
        let text = encode_frame(&build(request_id.clone()))?;

        let (reply, response) = oneshot::channel();
        let _guard = self.insert(
            request_id,
            Pending {
                matcher: Box::new(matcher),
                reply,
            },
        );

        let exchange = async move {
            let sent = outgoing.send(text).await.is_ok();
            drop(outgoing);
            if !sent {
                return Err(RelayError::NotConnected);
            }
            response
                .await
                .map_err(|_| RelayError::Other("pending request dropped".into()))
        };

        time::timeout(timeout, exchange)
            .await
            .unwrap_or(Err(RelayError::Timeout))
    }
}

/// Removes its entry on drop unless `resolve` already did.
struct PendingGuard {
    table: PendingRequests,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.lock().remove(&self.request_id).is_some() {
            trace!(request_id = %self.request_id, "pending request removed unanswered");
        }
    }
}
