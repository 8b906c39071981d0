//! Response envelopes of the compute API.
//!
//! The API wraps list responses differently depending on its version:
//!
//! - legacy: `{"servers": {"values": [...]}}`
//! - current: `{"servers": [...]}`
//!
//! The two shapes are separate contracts and get separate parse hooks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Which envelope the API speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    Legacy,
    #[default]
    Current,
}

impl Envelope {
    /// Extract the record list stored under `key`.
    pub fn parse(self, body: &Value, key: &str) -> Result<Vec<Value>> {
        match self {
            Envelope::Legacy => parse_legacy(body, key),
            Envelope::Current => parse_current(body, key),
        }
    }
}

impl std::str::FromStr for Envelope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(Envelope::Legacy),
            "current" => Ok(Envelope::Current),
            other => Err(Error::Parse(format!("unknown envelope: {}", other))),
        }
    }
}

/// `{key: {values: [...]}}`
pub fn parse_legacy(body: &Value, key: &str) -> Result<Vec<Value>> {
    let wrapper = body
        .get(key)
        .ok_or_else(|| Error::Parse(format!("missing '{}' in response", key)))?;
    match wrapper.get("values") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Null) => Ok(Vec::new()),
        Some(other) => Err(Error::Parse(format!(
            "'{}.values' is not a list: {}",
            key, other
        ))),
        None => Err(Error::Parse(format!("missing '{}.values' in response", key))),
    }
}

/// `{key: [...]}`
pub fn parse_current(body: &Value, key: &str) -> Result<Vec<Value>> {
    match body.get(key) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Null) => Ok(Vec::new()),
        Some(other) => Err(Error::Parse(format!("'{}' is not a list: {}", key, other))),
        None => Err(Error::Parse(format!("missing '{}' in response", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_envelope() {
        let body = json!({"servers": {"values": [{"id": 1}, {"id": 2}]}});
        let items = Envelope::Legacy.parse(&body, "servers").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_current_envelope() {
        let body = json!({"servers": [{"id": "a"}]});
        let items = Envelope::Current.parse(&body, "servers").unwrap();
        assert_eq!(items[0]["id"], "a");
    }

    #[test]
    fn test_envelopes_do_not_accept_each_other() {
        let legacy = json!({"images": {"values": []}});
        let current = json!({"images": []});
        assert!(Envelope::Current.parse(&legacy, "images").is_err());
        assert!(Envelope::Legacy.parse(&current, "images").is_err());
    }

    #[test]
    fn test_missing_key() {
        let err = parse_current(&json!({"other": []}), "flavors").unwrap_err();
        assert!(err.to_string().contains("flavors"));
    }
}
