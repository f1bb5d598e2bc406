//! Known users and their bearer-token digests.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::config::UserEntry;

/// A user the relay can authenticate and route to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub actors: Vec<String>,
}

impl UserRecord {
    /// Whether this user's token may register under `identity`.
    pub fn may_act_as(&self, identity: &str) -> bool {
        identity == self.user_id || self.actors.iter().any(|actor| actor == identity)
    }
}

/// Lowercase hex SHA-256 of a bearer token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Default)]
pub struct UserDirectory {
    by_digest: HashMap<String, String>,
    by_id: HashMap<String, UserRecord>,
    by_phone: HashMap<String, String>,
}

impl UserDirectory {
    pub fn new(entries: &[UserEntry]) -> Self {
        let mut dir = Self::default();
        for entry in entries {
            let record = UserRecord {
                user_id: entry.user_id.clone(),
                username: entry.username.clone(),
                phone: entry.phone.clone(),
                actors: entry.actors.clone(),
            };
            dir.by_digest
                .insert(entry.token_sha256.to_ascii_lowercase(), entry.user_id.clone());
            if let Some(phone) = &entry.phone {
                dir.by_phone.insert(phone.clone(), entry.user_id.clone());
            }
            dir.by_id.insert(entry.user_id.clone(), record);
        }
        dir
    }

    /// The user a bearer token belongs to.
    pub fn authenticate(&self, token: &str) -> Option<&UserRecord> {
        if token.is_empty() {
            return None;
        }
        let user_id = self.by_digest.get(&token_digest(token))?;
        self.by_id.get(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&UserRecord> {
        self.by_id.get(user_id)
    }

    pub fn by_phone(&self, phone: &str) -> Option<&UserRecord> {
        self.by_phone.get(phone).and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
