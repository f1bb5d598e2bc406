//! `relaycmd listen`: run a channel with the safe built-in commands until Ctrl-C.
//!
//! Element and notification commands have no display to act on here, so the
//! surface logs them.

use super::{open_channel, Settings};
use anyhow::Result;
use relaycmd_client::builtin::{ElementPatch, ElementSpec, Notification};
use relaycmd_client::{Builtins, HandlerResult, SenderInfo, Surface};
use std::sync::Arc;
use tracing::info;

/// Surface that records every effect as a log line.
#[derive(Debug, Default)]
pub struct LogSurface;

impl Surface for LogSurface {
    fn create_element(&self, spec: &ElementSpec, sender: &SenderInfo) -> HandlerResult {
        info!(
            id = %spec.id,
            tag = %spec.tag,
            parent = %spec.parent,
            from = %sender.display_name(),
            "create-element"
        );
        Ok(())
    }

    fn remove_element(&self, id: &str, sender: &SenderInfo) -> HandlerResult {
        info!(id = %id, from = %sender.display_name(), "remove-element");
        Ok(())
    }

    fn update_element(&self, patch: &ElementPatch, sender: &SenderInfo) -> HandlerResult {
        info!(id = %patch.id, from = %sender.display_name(), "update-element");
        Ok(())
    }

    fn show_notification(&self, notification: &Notification, sender: &SenderInfo) -> HandlerResult {
        println!(
            "[{:?}] {}: {}",
            notification.kind,
            sender.display_name(),
            notification.message
        );
        Ok(())
    }
}

pub async fn run(settings: &Settings, allow: &[String]) -> Result<()> {
    let channel = open_channel(settings)?;
    channel.set_allowed_senders(allow.iter().cloned());

    let builtins = Builtins::new(&channel, Arc::new(LogSurface));
    builtins.register_all();

    if !channel.start(settings.identity.clone()).await {
        channel.stop();
        anyhow::bail!("could not connect to {} (see log for details)", settings.url);
    }

    let me = channel.current_user_id().unwrap_or_default();
    println!("Listening on {} as {me} (Ctrl+C to stop)", settings.url);
    info!(url = %settings.url, user = %me, commands = ?channel.registry().names(), "listening");

    tokio::signal::ctrl_c().await?;

    builtins.unregister_all();
    channel.stop();
    println!("Stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_surface_accepts_everything() {
        let surface = LogSurface;
        let sender = SenderInfo::default();
        let spec: ElementSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(surface.create_element(&spec, &sender).is_ok());
        assert!(surface.remove_element(&spec.id, &sender).is_ok());

        let note: Notification =
            serde_json::from_value(serde_json::json!({"message": "hi", "type": "success"})).unwrap();
        assert!(surface.show_notification(&note, &sender).is_ok());
    }
}
