//! Context payload handed from the supervisor to the container's init

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Small string map built during network setup and sent to the child once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, String>);

impl Context {
    /// Create an empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the context is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_insert_get() {
        let mut context = Context::new();
        assert!(context.is_empty());

        context.insert("veth-child", "veth1a2b");
        context.insert("veth-child", "veth3c4d");

        assert_eq!(context.len(), 1);
        assert_eq!(context.get("veth-child"), Some("veth3c4d"));
        assert_eq!(context.get("missing"), None);
    }

    #[test]
    fn test_context_is_plain_json_object() {
        let mut context = Context::new();
        context.insert("veth-host", "veth0000");

        let json = serde_json::to_string(&context).unwrap();
        assert_eq!(json, r#"{"veth-host":"veth0000"}"#);
    }
}
