//! Built-in command set.
//!
//! Element and notification commands drive an injected [`Surface`]. `ping`
//! answers the sender with a `pong` command; `pong` logs the round trip.
//! `execute-code` is never part of the safe set: it needs the `execute_code`
//! capability (checked when registering and again on every call) and a
//! [`CodeSandbox`] to evaluate in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use relaycmd_core::{unix_millis, Params, Target};

use crate::channel::WeakChannel;
use crate::registry::{HandlerError, HandlerResult, SenderInfo};
use crate::transport::Connector;
use crate::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinCommand {
    CreateElement,
    RemoveElement,
    UpdateElement,
    ShowNotification,
    ExecuteCode,
    Ping,
    Pong,
}

impl BuiltinCommand {
    pub const ALL: [Self; 7] = [
        Self::CreateElement,
        Self::RemoveElement,
        Self::UpdateElement,
        Self::ShowNotification,
        Self::ExecuteCode,
        Self::Ping,
        Self::Pong,
    ];

    /// Installed by [`Builtins::register_all`].
    pub const SAFE: [Self; 6] = [
        Self::CreateElement,
        Self::RemoveElement,
        Self::UpdateElement,
        Self::ShowNotification,
        Self::Ping,
        Self::Pong,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateElement => "create-element",
            Self::RemoveElement => "remove-element",
            Self::UpdateElement => "update-element",
            Self::ShowNotification => "show-notification",
            Self::ExecuteCode => "execute-code",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Parameters of `create-element`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSpec {
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default = "generated_element_id")]
    pub id: String,
    #[serde(default = "default_parent")]
    pub parent: String,
    #[serde(default)]
    pub css: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

fn default_tag() -> String {
    "div".to_string()
}

fn default_parent() -> String {
    "#view".to_string()
}

fn generated_element_id() -> String {
    format!("remote_{}_{:06x}", unix_millis(), rand::random::<u32>() & 0x00ff_ffff)
}

/// Parameters of `update-element`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// Parameters of `show-notification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "default_notification_message")]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    #[serde(rename = "duration", default = "default_duration_ms")]
    pub duration_ms: u64,
}

fn default_notification_message() -> String {
    "Notification".to_string()
}

fn default_duration_ms() -> u64 {
    3000
}

/// Where element and notification commands take effect.
pub trait Surface: Send + Sync + 'static {
    fn create_element(&self, spec: &ElementSpec, sender: &SenderInfo) -> HandlerResult;
    fn remove_element(&self, id: &str, sender: &SenderInfo) -> HandlerResult;
    fn update_element(&self, patch: &ElementPatch, sender: &SenderInfo) -> HandlerResult;
    fn show_notification(&self, notification: &Notification, sender: &SenderInfo) -> HandlerResult;
}

/// Isolated evaluator for `execute-code`.
pub trait CodeSandbox: Send + Sync + 'static {
    fn evaluate(&self, code: &str, sender: &SenderInfo) -> Result<Value, HandlerError>;
}

/// Runtime capability switches. Everything is off by default.
#[derive(Debug, Default)]
pub struct Capabilities {
    execute_code: AtomicBool,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_execute_code(&self) {
        warn!("execute-code capability enabled");
        self.execute_code.store(true, Ordering::SeqCst);
    }

    pub fn disable_execute_code(&self) {
        info!("execute-code capability disabled");
        self.execute_code.store(false, Ordering::SeqCst);
    }

    pub fn execute_code_enabled(&self) -> bool {
        self.execute_code.load(Ordering::SeqCst)
    }
}

/// Installs built-in commands on a channel.
pub struct Builtins<C: Connector> {
    channel: WeakChannel<C>,
    surface: Arc<dyn Surface>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
    capabilities: Arc<Capabilities>,
}

impl<C: Connector> Builtins<C> {
    pub fn new(channel: &Channel<C>, surface: Arc<dyn Surface>) -> Self {
        Self {
            channel: channel.downgrade(),
            surface,
            sandbox: None,
            capabilities: Arc::new(Capabilities::new()),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    /// Install one command. Returns `false` if it cannot be installed.
    pub fn register(&self, command: BuiltinCommand) -> bool {
        let Some(channel) = self.channel.upgrade() else {
            return false;
        };
        let registry = channel.registry();
        let name = command.name();
        match command {
            BuiltinCommand::CreateElement => {
                let surface = self.surface.clone();
                registry.register(name, move |params: &Params, sender: &SenderInfo| {
                    let spec: ElementSpec = parse_params(params)?;
                    surface.create_element(&spec, sender)?;
                    info!(id = %spec.id, from = %sender.display_name(), "created element");
                    Ok(())
                });
            }
            BuiltinCommand::RemoveElement => {
                let surface = self.surface.clone();
                registry.register(name, move |params: &Params, sender: &SenderInfo| {
                    let id = params
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|id| !id.is_empty())
                        .ok_or_else(|| HandlerError::InvalidParams("missing id".into()))?;
                    surface.remove_element(id, sender)?;
                    info!(id = %id, from = %sender.display_name(), "removed element");
                    Ok(())
                });
            }
            BuiltinCommand::UpdateElement => {
                let surface = self.surface.clone();
                registry.register_patch(name, "id", move |params: &Params, sender: &SenderInfo| {
                    let patch: ElementPatch = parse_params(params)?;
                    surface.update_element(&patch, sender)?;
                    info!(id = %patch.id, from = %sender.display_name(), "updated element");
                    Ok(())
                });
            }
            BuiltinCommand::ShowNotification => {
                let surface = self.surface.clone();
                registry.register(name, move |params: &Params, sender: &SenderInfo| {
                    let notification: Notification = parse_params(params)?;
                    surface.show_notification(&notification, sender)?;
                    info!(from = %sender.display_name(), message = %notification.message, "notification");
                    Ok(())
                });
            }
            BuiltinCommand::ExecuteCode => {
                if !self.capabilities.execute_code_enabled() {
                    warn!("execute-code not registered: capability disabled");
                    return false;
                }
                let Some(sandbox) = self.sandbox.clone() else {
                    warn!("execute-code not registered: no sandbox configured");
                    return false;
                };
                let capabilities = self.capabilities.clone();
                registry.register(name, move |params: &Params, sender: &SenderInfo| {
                    if !capabilities.execute_code_enabled() {
                        return Err(HandlerError::Rejected("execute-code capability disabled".into()));
                    }
                    let code = params
                        .get("code")
                        .and_then(Value::as_str)
                        .filter(|code| !code.is_empty())
                        .ok_or_else(|| HandlerError::InvalidParams("missing code".into()))?;
                    warn!(from = %sender.display_name(), "evaluating remote code in sandbox");
                    sandbox.evaluate(code, sender)?;
                    Ok(())
                });
            }
            BuiltinCommand::Ping => {
                let channel = self.channel.clone();
                registry.register(name, move |_: &Params, sender: &SenderInfo| {
                    info!(from = %sender.display_name(), "ping received");
                    let user_id = sender
                        .user_id
                        .clone()
                        .ok_or_else(|| HandlerError::InvalidParams("ping without sender id".into()))?;
                    let runtime = tokio::runtime::Handle::try_current()
                        .map_err(|e| HandlerError::Failed(e.to_string()))?;
                    let channel = channel.clone();
                    runtime.spawn(async move {
                        let Some(channel) = channel.upgrade() else { return };
                        let now = unix_millis();
                        let params = pong_params(now);
                        let outcome = channel.send_command(Target::User(user_id), "pong", params).await;
                        if !outcome.success {
                            warn!(error = ?outcome.error, "failed to answer ping");
                        }
                    });
                    Ok(())
                });
            }
            BuiltinCommand::Pong => {
                registry.register(name, move |params: &Params, sender: &SenderInfo| {
                    let now = unix_millis();
                    let sent = params.get("timestamp").and_then(Value::as_u64).unwrap_or(now);
                    info!(
                        from = %sender.display_name(),
                        latency_ms = now.saturating_sub(sent),
                        "pong received"
                    );
                    Ok(())
                });
            }
        }
        true
    }

    pub fn unregister(&self, command: BuiltinCommand) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| channel.unregister(command.name()))
    }

    /// Install the safe set.
    pub fn register_all(&self) {
        for command in BuiltinCommand::SAFE {
            self.register(command);
        }
        info!("safe built-in commands registered");
    }

    /// Remove every built-in command, `execute-code` included.
    pub fn unregister_all(&self) {
        for command in BuiltinCommand::ALL {
            self.unregister(command);
        }
        info!("built-in commands unregistered");
    }
}

fn pong_params(now: u64) -> Params {
    let mut params = Params::new();
    params.insert("timestamp".into(), json!(now));
    params.insert("receivedAt".into(), json!(now));
    params
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: &Params) -> Result<T, HandlerError> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| HandlerError::InvalidParams(e.to_string()))
}
