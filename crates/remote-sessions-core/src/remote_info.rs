//! Opaque connection metadata returned by the remote host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields returned by the remote host for one session.
///
/// Passed through untouched; only the presence of the connection fields is
/// checked before a session is considered usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteInfo {
    pub fields: HashMap<String, Value>,
}

/// Keys accepted as the connection endpoint.
const ENDPOINT_KEYS: [&str; 3] = ["endpoint", "host", "address"];

impl RemoteInfo {
    /// Create remote info from raw fields.
    #[must_use]
    pub fn new(fields: HashMap<String, Value>) -> Self {
        Self { fields }
    }

    /// Get a field by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Connection endpoint, if present and non-empty.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        ENDPOINT_KEYS
            .iter()
            .filter_map(|key| self.fields.get(*key))
            .filter_map(Value::as_str)
            .find(|s| !s.is_empty())
    }

    /// Connection port. Numeric strings are accepted.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self.fields.get("port")? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Wire protocol hint (`ws`, `wss`, `vnc`, ...).
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.fields.get("protocol").and_then(Value::as_str)
    }

    /// Whether the minimum fields needed to connect are present.
    #[must_use]
    pub fn has_connection_fields(&self) -> bool {
        self.endpoint().is_some() && self.port().is_some()
    }
}

impl From<HashMap<String, Value>> for RemoteInfo {
    fn from(fields: HashMap<String, Value>) -> Self {
        Self::new(fields)
    }
}
