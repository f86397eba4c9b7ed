//! Small shared helpers

use crate::error::{ClusterError, Result};

/// Serialize a JSON value to its canonical string form.
///
/// `serde_json` keeps object keys sorted, so equal values always produce
/// equal strings. This is the representation used for compare-and-swap
/// previous values and for config snapshot diffing.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Validate a single path segment used as a config section, config key,
/// or lock name: non-empty and free of the path separator.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ClusterError::InvalidName(format!("{} must not be empty", kind)));
    }
    if name.contains('/') {
        return Err(ClusterError::InvalidName(format!(
            "{} '{}' must not contain '/'",
            kind, name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_canonical_json_scalars() {
        assert_eq!(canonical_json(&json!("1")), "\"1\"");
        assert_eq!(canonical_json(&json!(1)), "1");
        assert_ne!(canonical_json(&json!("1")), canonical_json(&json!(1)));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("section", "db").is_ok());
        assert!(validate_name("section", "").is_err());
        assert!(validate_name("key", "a/b").is_err());
    }
}
