use std::sync::RwLock;

use serde::Deserialize;

use crate::error::IoAt;
use crate::prelude::*;

/// The process-wide configuration store the cache variants read their
/// `*.dir` / `*.prefix` / `*.size` triples from.
///
/// How the store gets populated is the embedding server's business; this
/// crate only needs string lookups. A flat JSON object file can be merged in
/// with [`Keys::load_json_file`], and individual keys can be set directly
/// (the test suites do this).
pub struct Keys {
    map: RwLock<HashMap<String, String>>,
}

/// On-disk shape accepted by [`Keys::load_json_file`].
#[derive(Deserialize)]
struct KeyFile(HashMap<String, String>);

static THE_KEYS: Lazy<Keys> = Lazy::new(Keys::new);

impl Keys {
    pub fn new() -> Keys {
        Keys {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide instance.
    pub fn the_keys() -> &'static Keys {
        &THE_KEYS
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read_map().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.write_map().insert(key.into(), value.into());
    }

    /// Merge a flat JSON `{"key": "value", ...}` object into the store.
    /// Existing keys are overwritten.
    pub fn load_json_file(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).at(path)?;
        let KeyFile(entries) = serde_json::from_str(&text)
            .map_err(|e| CacheError::config(path.display().to_string(), e.to_string()))?;
        self.write_map().extend(entries);
        Ok(())
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.map.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Keys {
    fn default() -> Keys {
        Keys::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_set() {
        let keys = Keys::new();
        assert_eq!(keys.get("missing"), None);
        keys.set("a.b", "c");
        assert_eq!(keys.get("a.b"), Some("c".into()));
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, r#"{"cache.dir": "/tmp/c", "cache.size": "100"}"#).unwrap();

        let keys = Keys::new();
        keys.set("cache.dir", "stale");
        keys.load_json_file(&path).unwrap();
        assert_eq!(keys.get("cache.dir"), Some("/tmp/c".into()));
        assert_eq!(keys.get("cache.size"), Some("100".into()));
    }

    #[test]
    fn test_load_json_file_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, r#"["not", "a", "map"]"#).unwrap();

        let keys = Keys::new();
        assert!(matches!(
            keys.load_json_file(&path),
            Err(CacheError::Config { .. })
        ));
    }
}
