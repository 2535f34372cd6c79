//! Records flowing through the pipeline.
//!
//! Both records carry a free-form `type` string and a JSON object payload.
//! Neither has an identity: duplicates are legal and never deduplicated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action type used when a transaction action is built without an explicit one.
pub const TRANSACTION_ACTION_TYPE: &str = "devapi_transaction";

/// Something a collector observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Builds an event from a `json!({...})` literal. Non-object payloads are
    /// stored under a single `"value"` key.
    pub fn from_json(kind: impl Into<String>, data: Value) -> Self {
        Self::new(kind, into_object(data))
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Subtype tag executors inspect before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Generic,
    /// Submit a transaction through the wallet API.
    Transaction,
}

/// Something a strategy wants done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub tag: ActionKind,
}

impl Action {
    pub fn new(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
            tag: ActionKind::Generic,
        }
    }

    pub fn from_json(kind: impl Into<String>, data: Value) -> Self {
        Self::new(kind, into_object(data))
    }

    /// A transaction action carrying wallet API request parameters.
    pub fn transaction(params: Map<String, Value>) -> Self {
        Self {
            kind: TRANSACTION_ACTION_TYPE.to_string(),
            data: params,
            tag: ActionKind::Transaction,
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn is_transaction(&self) -> bool {
        self.tag == ActionKind::Transaction
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Reads a non-negative integer amount from a JSON value.
///
/// Accepts integers, finite non-negative floats (`2e18` style literals) and
/// decimal or `0x` hex strings. Amounts up to `u128::MAX` are supported so
/// that 18-decimal token balances never overflow.
pub fn amount_of(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Some(v as u128)
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f >= 0.0 && f < u128::MAX as f64 {
                    Some(f as u128)
                } else {
                    None
                }
            } else {
                None
            }
        }
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u128::from_str_radix(hex, 16).ok(),
                None => s.parse::<u128>().ok(),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_type_key() {
        let evt = Event::from_json("tick", json!({"n": 1}));
        let v = serde_json::to_value(&evt).unwrap();
        assert_eq!(v, json!({"type": "tick", "data": {"n": 1}}));
    }

    #[test]
    fn action_defaults_to_generic_tag() {
        let a: Action = serde_json::from_value(json!({"type": "log", "data": {}})).unwrap();
        assert_eq!(a.tag, ActionKind::Generic);
        assert!(!a.is_transaction());
    }

    #[test]
    fn transaction_action_uses_default_type() {
        let a = Action::transaction(Map::new());
        assert!(a.is(TRANSACTION_ACTION_TYPE));
        assert!(a.is_transaction());
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let evt = Event::from_json("price", json!(42));
        assert_eq!(evt.get("value"), Some(&json!(42)));
        assert!(Event::from_json("empty", Value::Null).data.is_empty());
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(amount_of(&json!(7)), Some(7));
        assert_eq!(amount_of(&json!(2e18)), Some(2_000_000_000_000_000_000));
        assert_eq!(
            amount_of(&json!("340282366920938463463374607431768211455")),
            Some(u128::MAX)
        );
        assert_eq!(amount_of(&json!("0x0de0b6b3a7640000")), Some(1_000_000_000_000_000_000));
        assert_eq!(amount_of(&json!(-1)), None);
        assert_eq!(amount_of(&json!("abc")), None);
        assert_eq!(amount_of(&json!(null)), None);
    }
}
