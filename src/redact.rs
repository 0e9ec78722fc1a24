//! Secret redaction for connection parameters.
//!
//! Applied before a job record is ever persisted or logged, and checked
//! again before the scheduler dispatches a run so a redacted template can
//! never be used to actually connect to anything.

use serde_json::Value;

use crate::error::{BackupError, Result};

const SENSITIVE_KEYS: [&str; 5] = ["password", "uri", "token", "secret", "azure_connection_string"];

/// Replaces sensitive fields with `***` before the value is persisted.
pub fn redact(params: &Value) -> Value {
    let Value::Object(map) = params else {
        return params.clone();
    };

    let mut result = map.clone();
    for key in SENSITIVE_KEYS {
        if let Some(value) = result.get(key) {
            let is_present = match value {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                _ => true,
            };
            if is_present {
                result.insert(key.to_string(), Value::String("***".to_string()));
            }
        }
    }
    Value::Object(result)
}

/// Rejects connection parameters that still carry a `***` placeholder —
/// the scheduler must never attempt to dial out with a redacted value.
pub fn ensure_not_redacted(params: &Value) -> Result<()> {
    let Value::Object(map) = params else {
        return Ok(());
    };

    let redacted_fields: Vec<&str> = SENSITIVE_KEYS
        .iter()
        .filter(|key| {
            map.get(**key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim() == "***")
                .unwrap_or(false)
        })
        .copied()
        .collect();

    if redacted_fields.is_empty() {
        return Ok(());
    }

    Err(BackupError::input(format!(
        "Schedule connection_params has redacted values for: {}. Store real values before running scheduler.",
        redacted_fields.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_known_sensitive_fields_only() {
        let params = json!({"host": "db", "password": "hunter2", "port": 5432});
        let redacted = redact(&params);
        assert_eq!(redacted["password"], "***");
        assert_eq!(redacted["host"], "db");
        assert_eq!(redacted["port"], 5432);
    }

    #[test]
    fn empty_password_is_left_alone() {
        let params = json!({"password": ""});
        let redacted = redact(&params);
        assert_eq!(redacted["password"], "");
    }

    #[test]
    fn ensure_not_redacted_rejects_placeholder() {
        let params = json!({"password": "***", "host": "db"});
        let err = ensure_not_redacted(&params).unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn ensure_not_redacted_accepts_real_values() {
        let params = json!({"password": "hunter2"});
        assert!(ensure_not_redacted(&params).is_ok());
    }
}
