use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use serde_json::Value;

/// Resolves spec identities to their documents.
///
/// Specs live as YAML files under the site's `specs/` directory and
/// are served as JSON. Resolved documents are cached; the cache is
/// cleared on SIGHUP without dropping connections.
pub struct SpecResolver {
    specs_dir: PathBuf,
    cache: Mutex<BTreeMap<String, Value>>,
}

impl SpecResolver {
    pub fn new(specs_dir: PathBuf) -> Self {
        Self {
            specs_dir,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Spec identities known to this server, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.specs_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "yaml"))
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        names
    }

    pub fn contains(&self, identity: &str) -> bool {
        !valid_identity(identity).is_empty() && self.spec_path(identity).exists()
    }

    /// Resolve a spec document, serving from cache when possible.
    pub fn resolve(&self, identity: &str) -> Result<Value> {
        if valid_identity(identity).is_empty() {
            anyhow::bail!("Invalid spec identity: '{}'", identity);
        }
        if let Some(cached) = self.cache.lock().unwrap().get(identity) {
            return Ok(cached.clone());
        }

        let path = self.spec_path(identity);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Spec not found: {}", identity))?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid spec YAML: {}", path.display()))?;
        let json = serde_json::to_value(yaml)
            .with_context(|| format!("Spec is not a mapping: {}", path.display()))?;

        self.cache
            .lock()
            .unwrap()
            .insert(identity.to_string(), json.clone());
        Ok(json)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    fn spec_path(&self, identity: &str) -> PathBuf {
        self.specs_dir.join(format!("{}.yaml", identity))
    }
}

/// Identities are single path segments; anything else is rejected
/// before touching the filesystem.
fn valid_identity(identity: &str) -> &str {
    if identity.is_empty()
        || identity.contains('/')
        || identity.contains('\\')
        || identity.contains("..")
    {
        return "";
    }
    identity
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver(tmp: &TempDir) -> SpecResolver {
        std::fs::write(
            tmp.path().join("s1-spec.yaml"),
            "role: edge\npackages:\n  - nginx\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("base.yaml"), "role: base\n").unwrap();
        SpecResolver::new(tmp.path().to_path_buf())
    }

    #[test]
    fn test_list_sorted() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver(&tmp);
        assert_eq!(resolver.list(), vec!["base", "s1-spec"]);
    }

    #[test]
    fn test_resolve_yaml_as_json() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver(&tmp);
        let spec = resolver.resolve("s1-spec").unwrap();
        assert_eq!(spec["role"], "edge");
        assert_eq!(spec["packages"][0], "nginx");
    }

    #[test]
    fn test_cache_survives_file_removal_until_cleared() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver(&tmp);
        resolver.resolve("base").unwrap();

        std::fs::remove_file(tmp.path().join("base.yaml")).unwrap();
        // Still cached.
        resolver.resolve("base").unwrap();

        resolver.clear_cache();
        assert!(resolver.resolve("base").is_err());
    }

    #[test]
    fn test_unknown_spec_errors() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver(&tmp);
        assert!(resolver.resolve("ghost").is_err());
        assert!(!resolver.contains("ghost"));
    }

    #[test]
    fn test_traversal_identities_rejected() {
        let tmp = TempDir::new().unwrap();
        let resolver = resolver(&tmp);
        for bad in ["../secrets", "a/b", "", "..\\x"] {
            assert!(resolver.resolve(bad).is_err(), "identity {:?}", bad);
            assert!(!resolver.contains(bad));
        }
    }
}
