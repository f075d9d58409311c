use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// String-keyed value map propagated through a run.
///
/// Parents write identifiers and addresses as nodes complete; children
/// read them by name lookup. A small set of well-known keys is defined
/// below; unknown keys pass through delegation unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, String>,
}

/// Well-known context keys.
pub const KEY_PARENT_ADDRESS: &str = "parent_address";
pub const KEY_SPEC_SERVER: &str = "spec_server";
pub const KEY_REPO_SERVER: &str = "repo_server";
pub const KEY_REPO_TOKEN: &str = "repo_token";
pub const KEY_REPO_REF: &str = "repo_ref";

/// Context key carrying the identifier the hypervisor assigned to a node.
pub fn id_key(node: &str) -> String {
    format!("{}_id", node)
}

/// Context key carrying a node's reachable address.
pub fn address_key(node: &str) -> String {
    format!("{}_address", node)
}

/// Context key carrying a node's minted provisioning token.
pub fn token_key(node: &str) -> String {
    format!("{}_token", node)
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Merge additions in, overwriting existing keys.
    pub fn merge(&mut self, additions: &BTreeMap<String, String>) {
        for (k, v) in additions {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.values
    }

    /// Assigned identifier for a node, if present and numeric.
    pub fn node_id(&self, node: &str) -> Option<u64> {
        self.get(&id_key(node)).and_then(|v| v.parse().ok())
    }

    /// Reachable address for a node, if present.
    pub fn node_address(&self, node: &str) -> Option<&str> {
        self.get(&address_key(node))
    }
}

impl FromIterator<(String, String)> for Context {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_keys() {
        assert_eq!(id_key("edge"), "edge_id");
        assert_eq!(address_key("edge"), "edge_address");
        assert_eq!(token_key("edge"), "edge_token");
    }

    #[test]
    fn test_merge_overwrites() {
        let mut ctx = Context::new();
        ctx.set("a_address", "10.0.0.1");

        let mut additions = BTreeMap::new();
        additions.insert("a_address".to_string(), "10.0.0.2".to_string());
        additions.insert("a_id".to_string(), "99100".to_string());
        ctx.merge(&additions);

        assert_eq!(ctx.node_address("a"), Some("10.0.0.2"));
        assert_eq!(ctx.node_id("a"), Some(99100));
    }

    #[test]
    fn test_node_id_requires_numeric() {
        let mut ctx = Context::new();
        ctx.set("a_id", "not-a-number");
        assert_eq!(ctx.node_id("a"), None);
    }

    #[test]
    fn test_serde_is_flat_map() {
        let mut ctx = Context::new();
        ctx.set("edge_address", "192.0.2.7");
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"edge_address":"192.0.2.7"}"#);
        let parsed: Context = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
