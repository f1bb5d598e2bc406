//! Command registry: command name to handler.
//!
//! Registering a name that already exists replaces the previous handler (last
//! write wins); `register` reports whether a replacement happened. Lookups
//! clone the registration out of the map, so a handler may register or
//! unregister commands while it runs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use relaycmd_core::{ConsoleMessage, Params};

/// Identity metadata attached to a dispatched command.
///
/// Always taken from the relay-supplied frame, never from the command payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderInfo {
    pub user_id: Option<String>,
    pub phone: Option<String>,
    pub username: Option<String>,
    pub timestamp: Option<Value>,
}

impl SenderInfo {
    pub fn from_message(message: &ConsoleMessage) -> Self {
        Self {
            user_id: message.sender_user_id().map(str::to_string),
            phone: message.sender_phone().map(str::to_string),
            username: message.sender_username().map(str::to_string),
            timestamp: message.timestamp.clone(),
        }
    }

    /// Username if known, else user id.
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Failed(String),
}

pub type HandlerResult = Result<(), HandlerError>;

/// A command implementation.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, params: &Params, sender: &SenderInfo) -> HandlerResult;
}

impl<F> CommandHandler for F
where
    F: Fn(&Params, &SenderInfo) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, params: &Params, sender: &SenderInfo) -> HandlerResult {
        self(params, sender)
    }
}

/// A registered handler and how it is guarded.
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn CommandHandler>,
    /// For property-patch commands: the params key naming the patched target.
    /// Such commands go through the dedup window.
    pub patch_target: Option<String>,
}

#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: Arc<RwLock<HashMap<String, Registration>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Returns `true` if it replaced one.
    pub fn register<F>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Params, &SenderInfo) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(
            name.into(),
            Registration {
                handler: Arc::new(handler),
                patch_target: None,
            },
        )
    }

    /// Register a property-patch handler. Identical patches for the same
    /// `params[target_key]` inside the dedup window are applied once.
    pub fn register_patch<F>(
        &self,
        name: impl Into<String>,
        target_key: impl Into<String>,
        handler: F,
    ) -> bool
    where
        F: Fn(&Params, &SenderInfo) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(
            name.into(),
            Registration {
                handler: Arc::new(handler),
                patch_target: Some(target_key.into()),
            },
        )
    }

    /// Register a shared handler object.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> bool {
        self.insert(
            name.into(),
            Registration {
                handler,
                patch_target: None,
            },
        )
    }

    fn insert(&self, name: String, registration: Registration) -> bool {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), registration)
            .is_some();
        if replaced {
            debug!(command = %name, "replaced handler");
        } else {
            debug!(command = %name, "registered handler");
        }
        replaced
    }

    /// Remove a handler. Returns `true` if one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        debug!(command = %name, removed, "unregistered handler");
        removed
    }

    pub fn lookup(&self, name: &str) -> Option<Registration> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
