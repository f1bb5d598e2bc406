//! Bounded per-user queue for messages addressed to offline users.

use std::collections::{HashMap, VecDeque};

use relaycmd_core::ConsoleMessage;
use tracing::debug;

#[derive(Debug)]
pub struct OfflineQueue {
    limit: usize,
    pending: HashMap<String, VecDeque<ConsoleMessage>>,
}

impl OfflineQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            pending: HashMap::new(),
        }
    }

    /// Queue a delivery. When the user's queue is full the oldest entry is
    /// dropped.
    pub fn push(&mut self, user_id: &str, message: ConsoleMessage) {
        let queue = self.pending.entry(user_id.to_string()).or_default();
        if queue.len() >= self.limit {
            queue.pop_front();
            debug!(user = %user_id, "offline queue full, dropped oldest message");
        }
        queue.push_back(message);
    }

    /// Take everything queued for `user_id`, oldest first.
    pub fn drain(&mut self, user_id: &str) -> Vec<ConsoleMessage> {
        self.pending
            .remove(user_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn len_for(&self, user_id: &str) -> usize {
        self.pending.get(user_id).map_or(0, VecDeque::len)
    }
}
