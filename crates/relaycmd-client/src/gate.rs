//! Sender gate applied to every delivered command before dispatch.
//!
//! Checks run in a fixed order: allow-list, then self-origination. The relay
//! side of the gate (injection screening) lives in `relaycmd_core::screen`.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

/// Why the gate turned a sender away, or that it let them through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Allowed,
    /// The allow-list is non-empty and the sender is not on it.
    NotAllowed,
    /// The sender is this channel's own identity.
    SelfOrigin,
}

#[derive(Debug, Clone, Default)]
pub struct SenderGate {
    allowed: Arc<RwLock<Arc<HashSet<String>>>>,
}

impl SenderGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole allow-list. An empty list allows every sender.
    pub fn set_allowed_senders<I, S>(&self, user_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = user_ids
            .into_iter()
            .map(|id| {
                let id: String = id.into();
                id.trim().to_string()
            })
            .filter(|id| !id.is_empty())
            .collect();
        *self.allowed.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(set);
    }

    /// Snapshot of the current allow-list.
    pub fn allowed_senders(&self) -> Arc<HashSet<String>> {
        self.allowed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn check(&self, sender: Option<&str>, own_identity: Option<&str>) -> GateVerdict {
        let allowed = self.allowed_senders();
        if !allowed.is_empty() && !sender.is_some_and(|id| allowed.contains(id)) {
            return GateVerdict::NotAllowed;
        }
        match (sender, own_identity) {
            (Some(from), Some(me)) if from == me => GateVerdict::SelfOrigin,
            _ => GateVerdict::Allowed,
        }
    }
}
