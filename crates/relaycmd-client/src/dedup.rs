//! Dedup window for property-patch commands.
//!
//! One entry per `(command, target)`: the digest of the last applied params
//! and when it was applied. A patch with the same digest inside the window is
//! dropped; anything else replaces the entry.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use relaycmd_core::Params;

/// Entry count above which expired entries are pruned on insert.
const PRUNE_THRESHOLD: usize = 800;

struct Applied {
    digest: String,
    at: Instant,
}

pub struct DedupGuard {
    window: Duration,
    entries: Mutex<HashMap<(String, String), Applied>>,
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record `params` as applied to `target` unless an identical patch was
    /// applied within the window. Returns `false` for a duplicate.
    pub fn admit(&self, command: &str, target: &str, params: &Params) -> bool {
        let digest = params_digest(params);
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let key = (command.to_string(), target.to_string());
        if let Some(prev) = entries.get(&key) {
            if prev.digest == digest && now.duration_since(prev.at) < self.window {
                return false;
            }
        }

        entries.insert(key, Applied { digest, at: now });
        if entries.len() > PRUNE_THRESHOLD {
            let window = self.window;
            entries.retain(|_, applied| now.duration_since(applied.at) < window);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn params_digest(params: &Params) -> String {
    // Map serialization is key-ordered, so equal params give equal digests.
    let serialized = serde_json::to_string(params).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}
