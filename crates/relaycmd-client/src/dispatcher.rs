//! Inbound command dispatch.
//!
//! A delivered `console-message` goes through, in order: probe filter,
//! allow-list, self-origination, envelope parse, registry lookup, dedup (patch
//! commands only), and finally the handler. Every step that drops the message
//! reports why in the returned [`DispatchOutcome`]; nothing here returns an
//! error to the channel.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, trace};

use relaycmd_core::{CommandEnvelope, ConsoleMessage};

use crate::dedup::DedupGuard;
use crate::gate::{GateVerdict, SenderGate};
use crate::registry::{CommandRegistry, SenderInfo};

/// Marker carried by relay probe traffic; such messages are never commands.
pub const PROBE_MARKER: &str = "dm_probe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Probe,
    NotAllowed,
    SelfOrigin,
    /// The text was not a command envelope. Ordinary chat traffic.
    NotACommand,
    UnknownCommand(String),
    Duplicate(String),
    Handled(String),
    HandlerFailed { command: String, reason: String },
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }
}

pub struct Dispatcher {
    registry: CommandRegistry,
    gate: SenderGate,
    dedup: DedupGuard,
}

impl Dispatcher {
    pub fn new(registry: CommandRegistry, gate: SenderGate, dedup_window: Duration) -> Self {
        Self {
            registry,
            gate,
            dedup: DedupGuard::new(dedup_window),
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &SenderGate {
        &self.gate
    }

    pub fn dispatch(&self, message: &ConsoleMessage, own_identity: Option<&str>) -> DispatchOutcome {
        if message.message.contains(PROBE_MARKER) {
            trace!("ignoring probe message");
            return DispatchOutcome::Probe;
        }

        let sender = SenderInfo::from_message(message);
        match self.gate.check(sender.user_id.as_deref(), own_identity) {
            GateVerdict::Allowed => {}
            GateVerdict::NotAllowed => {
                debug!(sender = ?sender.user_id, "sender not in allow-list");
                return DispatchOutcome::NotAllowed;
            }
            GateVerdict::SelfOrigin => {
                debug!(sender = ?sender.user_id, "ignoring self-originated command");
                return DispatchOutcome::SelfOrigin;
            }
        }

        let Some(envelope) = CommandEnvelope::parse(&message.message) else {
            trace!("message is not a command envelope");
            return DispatchOutcome::NotACommand;
        };
        let command = envelope.command;

        let Some(registration) = self.registry.lookup(&command) else {
            debug!(command = %command, "no handler registered");
            return DispatchOutcome::UnknownCommand(command);
        };

        if let Some(key) = registration.patch_target.as_deref() {
            if let Some(target) = envelope.params.get(key).and_then(target_string) {
                if !self.dedup.admit(&command, &target, &envelope.params) {
                    debug!(command = %command, key = %target, "duplicate patch dropped");
                    return DispatchOutcome::Duplicate(command);
                }
            }
        }

        let handler = registration.handler;
        let params = envelope.params;
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&params, &sender)));

        match result {
            Ok(Ok(())) => {
                debug!(command = %command, from = %sender.display_name(), "command handled");
                DispatchOutcome::Handled(command)
            }
            Ok(Err(e)) => {
                error!(command = %command, error = %e, "command handler failed");
                DispatchOutcome::HandlerFailed {
                    command,
                    reason: e.to_string(),
                }
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(command = %command, panic = %reason, "command handler panicked");
                DispatchOutcome::HandlerFailed { command, reason }
            }
        }
    }
}

fn target_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use relaycmd_core::{Params, PeerAddress};
    use serde_json::json;

    use crate::registry::{HandlerError, HandlerResult};

    type Calls = Arc<Mutex<Vec<(Params, SenderInfo)>>>;

    fn recording(calls: &Calls) -> impl Fn(&Params, &SenderInfo) -> HandlerResult + Send + Sync + 'static {
        let calls = calls.clone();
        move |params: &Params, sender: &SenderInfo| {
            calls.lock().unwrap().push((params.clone(), sender.clone()));
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(CommandRegistry::new(), SenderGate::new(), Duration::from_millis(100))
    }

    fn from(user: &str, text: &str) -> ConsoleMessage {
        ConsoleMessage {
            from: Some(PeerAddress {
                user_id: Some(user.to_string()),
                ..Default::default()
            }),
            message: text.to_string(),
            timestamp: Some(json!("2024-01-01T00:00:00Z")),
            ..Default::default()
        }
    }

    #[test]
    fn registered_command_invoked_once_with_sender() {
        let d = dispatcher();
        let calls = Calls::default();
        d.registry().register("ping", recording(&calls));

        let outcome = d.dispatch(&from("u2", r#"{"command":"ping","params":{}}"#), Some("u1"));
        assert_eq!(outcome, DispatchOutcome::Handled("ping".into()));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.is_empty());
        assert_eq!(calls[0].1.user_id.as_deref(), Some("u2"));
        assert_eq!(calls[0].1.timestamp, Some(json!("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn self_originated_command_not_dispatched() {
        let d = dispatcher();
        let calls = Calls::default();
        d.registry().register("ping", recording(&calls));

        let outcome = d.dispatch(&from("u1", r#"{"command":"ping","params":{}}"#), Some("u1"));
        assert_eq!(outcome, DispatchOutcome::SelfOrigin);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn allow_list_filters_senders() {
        let d = dispatcher();
        let calls = Calls::default();
        d.registry().register("ping", recording(&calls));
        d.gate().set_allowed_senders(["A"]);

        let env = r#"{"command":"ping"}"#;
        assert_eq!(d.dispatch(&from("B", env), Some("u1")), DispatchOutcome::NotAllowed);
        assert!(d.dispatch(&from("A", env), Some("u1")).is_handled());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_command_is_silent() {
        let d = dispatcher();
        let outcome = d.dispatch(&from("u2", r#"{"command":"nope"}"#), Some("u1"));
        assert_eq!(outcome, DispatchOutcome::UnknownCommand("nope".into()));
    }

    #[test]
    fn unregistered_command_stops_dispatching() {
        let d = dispatcher();
        let calls = Calls::default();
        d.registry().register("ping", recording(&calls));
        d.registry().unregister("ping");

        let outcome = d.dispatch(&from("u2", r#"{"command":"ping"}"#), None);
        assert_eq!(outcome, DispatchOutcome::UnknownCommand("ping".into()));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn plain_text_and_malformed_envelopes_ignored() {
        let d = dispatcher();
        for text in ["hello there", "{not json", r#"{"params":{}}"#, r#"{"command":5}"#] {
            assert_eq!(d.dispatch(&from("u2", text), None), DispatchOutcome::NotACommand);
        }
    }

    #[test]
    fn probe_messages_skipped_first() {
        let d = dispatcher();
        d.gate().set_allowed_senders(["A"]);
        let outcome = d.dispatch(&from("B", r#"{"command":"dm_probe"}"#), None);
        assert_eq!(outcome, DispatchOutcome::Probe);
    }

    #[test]
    fn handler_error_and_panic_contained() {
        let d = dispatcher();
        d.registry().register("fail", |_: &Params, _: &SenderInfo| {
            Err(HandlerError::Failed("boom".into()))
        });
        d.registry().register("explode", |_: &Params, _: &SenderInfo| -> HandlerResult {
            panic!("kaboom")
        });
        let calls = Calls::default();
        d.registry().register("ok", recording(&calls));

        assert_eq!(
            d.dispatch(&from("u2", r#"{"command":"fail"}"#), None),
            DispatchOutcome::HandlerFailed {
                command: "fail".into(),
                reason: "boom".into()
            }
        );
        assert_eq!(
            d.dispatch(&from("u2", r#"{"command":"explode"}"#), None),
            DispatchOutcome::HandlerFailed {
                command: "explode".into(),
                reason: "kaboom".into()
            }
        );
        assert!(d.dispatch(&from("u2", r#"{"command":"ok"}"#), None).is_handled());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_patches_within_window_apply_once() {
        let d = dispatcher();
        let calls = Calls::default();
        d.registry().register_patch("update-element", "id", recording(&calls));

        let env = r#"{"command":"update-element","params":{"id":"box","left":"10px"}}"#;
        assert!(d.dispatch(&from("u2", env), None).is_handled());
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(
            d.dispatch(&from("u2", env), None),
            DispatchOutcome::Duplicate("update-element".into())
        );
        assert_eq!(calls.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(d.dispatch(&from("u2", env), None).is_handled());
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn non_patch_commands_never_deduped() {
        let d = dispatcher();
        let calls = Calls::default();
        d.registry().register("ping", recording(&calls));
        let env = r#"{"command":"ping","params":{"id":"x"}}"#;
        d.dispatch(&from("u2", env), None);
        d.dispatch(&from("u2", env), None);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }
}
