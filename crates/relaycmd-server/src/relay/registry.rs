//! Registry of authenticated connections.
//!
//! Connections are indexed by their routing user id; one user may hold several
//! live connections (several devices, or several actors pinned with
//! `registerAs` on the same token).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// An authenticated connection able to receive deliveries.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub connection_id: u64,
    pub user_id: String,
    /// Outbound text frames for this connection.
    pub sender: mpsc::Sender<String>,
    pub registered_at: Instant,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<u64, ConnectionEntry>,
    by_user: HashMap<String, HashSet<u64>>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    tables: Arc<RwLock<Tables>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register under a new identity) a connection.
    pub async fn register(&self, connection_id: u64, user_id: String, sender: mpsc::Sender<String>) {
        let mut tables = self.tables.write().await;
        if let Some(previous) = tables.connections.remove(&connection_id) {
            remove_index(&mut tables, &previous.user_id, connection_id);
        }
        tables
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(connection_id);
        tables.connections.insert(
            connection_id,
            ConnectionEntry {
                connection_id,
                user_id: user_id.clone(),
                sender,
                registered_at: Instant::now(),
            },
        );
        info!(user = %user_id, connection_id, "connection registered");
    }

    pub async fn unregister(&self, connection_id: u64) {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.connections.remove(&connection_id) {
            remove_index(&mut tables, &entry.user_id, connection_id);
            debug!(user = %entry.user_id, connection_id, "connection unregistered");
        }
    }

    /// Live connections of `user_id`, except `exclude`.
    pub async fn connections_of(&self, user_id: &str, exclude: Option<u64>) -> Vec<ConnectionEntry> {
        let tables = self.tables.read().await;
        let Some(ids) = tables.by_user.get(user_id) else {
            return Vec::new();
        };
        let mut entries: Vec<ConnectionEntry> = ids
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| tables.connections.get(id).cloned())
            .collect();
        entries.sort_by_key(|e| e.connection_id);
        entries
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.tables.read().await.by_user.contains_key(user_id)
    }

    /// Number of registered connections.
    pub async fn count(&self) -> usize {
        self.tables.read().await.connections.len()
    }
}

fn remove_index(tables: &mut Tables, user_id: &str, connection_id: u64) {
    if let Some(ids) = tables.by_user.get_mut(user_id) {
        ids.remove(&connection_id);
        if ids.is_empty() {
            tables.by_user.remove(user_id);
        }
    }
}
