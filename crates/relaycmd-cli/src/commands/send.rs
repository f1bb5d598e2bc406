//! `relaycmd send`: deliver one command to a peer and print the outcome as JSON.

use super::{open_channel, Settings};
use anyhow::{Context, Result};
use relaycmd_core::{Params, Target};
use serde_json::Value;
use tracing::debug;

/// Build the addressing target from the mutually exclusive flags.
pub fn target(to_user: Option<String>, to_phone: Option<String>) -> Result<Target> {
    match (to_user, to_phone) {
        (Some(user), None) if !user.trim().is_empty() => Ok(Target::User(user)),
        (None, Some(phone)) if !phone.trim().is_empty() => Ok(Target::Phone(phone)),
        (Some(_), Some(_)) => anyhow::bail!("--to-user and --to-phone are mutually exclusive"),
        _ => anyhow::bail!("a recipient is required: --to-user <id> or --to-phone <number>"),
    }
}

/// Parse `--params`: a JSON object, `null`, or nothing.
pub fn parse_params(raw: Option<&str>) -> Result<Params> {
    let Some(raw) = raw else {
        return Ok(Params::new());
    };
    let value: Value = serde_json::from_str(raw).context("--params is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Params::new()),
        other => anyhow::bail!("--params must be a JSON object, got {other}"),
    }
}

pub async fn run(settings: &Settings, target: Target, command: &str, params: Params) -> Result<()> {
    let channel = open_channel(settings)?;

    if !channel.start(settings.identity.clone()).await {
        channel.stop();
        anyhow::bail!("could not connect to {} (see log for details)", settings.url);
    }
    debug!(to = %target, command, "sending command");

    let outcome = channel.send_command(target, command, params).await;
    channel.stop();

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        anyhow::bail!(
            "send failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_requires_exactly_one() {
        assert_eq!(
            target(Some("u2".into()), None).unwrap(),
            Target::User("u2".into())
        );
        assert_eq!(
            target(None, Some("+100".into())).unwrap(),
            Target::Phone("+100".into())
        );
        assert!(target(Some("u2".into()), Some("+100".into())).is_err());
        assert!(target(None, None).is_err());
        assert!(target(Some(" ".into()), None).is_err());
    }

    #[test]
    fn params_parsing() {
        assert!(parse_params(None).unwrap().is_empty());
        assert!(parse_params(Some("null")).unwrap().is_empty());

        let params = parse_params(Some(r#"{"id":"box","css":{"color":"red"}}"#)).unwrap();
        assert_eq!(params.get("id"), Some(&json!("box")));

        assert!(parse_params(Some("[1,2]")).is_err());
        assert!(parse_params(Some("{oops")).is_err());
    }
}
