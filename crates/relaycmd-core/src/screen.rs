//! Recursive injection-signature screen for relay payloads.
//!
//! Every string reachable from the payload (object values, array items, at any
//! depth) is compared case-insensitively against a fixed signature list.

use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// Code sent back in a `security-violation` frame.
pub const INJECTION_CODE: &str = "INJECTION_DETECTED";

const INJECTION_SIGNATURES: &[&str] = &[
    "'; drop table",
    "union select",
    "<script>",
    "javascript:",
    "eval(",
    "exec(",
];

/// Return the first signature found anywhere in `value`.
pub fn find_injection(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(s) => {
            let lower = s.to_lowercase();
            INJECTION_SIGNATURES
                .iter()
                .copied()
                .find(|sig| lower.contains(sig))
        }
        Value::Array(items) => items.iter().find_map(find_injection),
        Value::Object(map) => map.values().find_map(find_injection),
        _ => None,
    }
}

/// Fail with [`RelayError::SecurityViolation`] if `value` matches a signature.
pub fn screen(value: &Value) -> RelayResult<()> {
    match find_injection(value) {
        Some(signature) => Err(RelayError::SecurityViolation(format!(
            "payload matches injection signature {signature:?}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_payload_passes() {
        let v = json!({"type": "direct-message", "message": "{\"command\":\"ping\"}", "n": 3});
        assert!(screen(&v).is_ok());
    }

    #[test]
    fn detects_nested_signatures() {
        let v = json!({"a": {"b": [1, {"c": "x UNION SELECT password"}]}});
        assert_eq!(find_injection(&v), Some("union select"));

        let v = json!({"message": "{\"command\":\"x\",\"params\":{\"html\":\"<SCRIPT>alert(1)\"}}"});
        assert_eq!(find_injection(&v), Some("<script>"));
    }

    #[test]
    fn detects_call_patterns() {
        assert!(screen(&json!(["eval(1)"])).is_err());
        assert!(screen(&json!({"k": "os.exec(cmd)"})).is_err());
        assert!(screen(&json!({"k": "'; DROP TABLE users"})).is_err());
        assert!(screen(&json!({"href": "JavaScript:void(0)"})).is_err());
    }

    #[test]
    fn only_values_are_screened() {
        assert!(screen(&json!({"eval(": 1})).is_ok());
    }
}
