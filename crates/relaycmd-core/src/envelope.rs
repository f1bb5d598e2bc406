//! Command envelope carried as JSON text inside a peer message.
//!
//! Wire shape: `{"command": "<name>", "params": {...}}`. `params` is optional;
//! a missing or `null` value means an empty object.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::RelayResult;

/// Parameters passed to a command handler.
pub type Params = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandEnvelope {
    pub command: String,
    pub params: Params,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>, params: Params) -> Self {
        Self {
            command: command.into(),
            params,
        }
    }

    /// Parse a peer message as a command envelope.
    ///
    /// Returns `None` for anything that is not a well-formed envelope: plain
    /// text, JSON that is not an object, a missing or non-string `command`,
    /// or `params` that is neither an object nor `null`.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => return None,
        };

        let command = match object.remove("command") {
            Some(Value::String(command)) => command,
            _ => return None,
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => Params::new(),
            Some(Value::Object(params)) => params,
            Some(_) => return None,
        };

        Some(Self { command, params })
    }

    /// Encode as the JSON string placed in a `direct-message.message` field.
    pub fn to_json_string(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
