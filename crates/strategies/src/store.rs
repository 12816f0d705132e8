use crate::error::{Error, Result};
use crate::schema::RawStrategy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Where strategy payloads come from. Loading does not validate; callers run
/// the result through a [`crate::StrategyValidator`].
pub trait StrategyStore: Send + Sync {
    fn load(&self, id: &str) -> Result<RawStrategy>;

    /// Ids of every strategy the store can currently load.
    fn list(&self) -> Result<Vec<String>>;
}

/// Loads `<dir>/<id>.json` or `<dir>/<id>.toml`, JSON first.
#[derive(Debug, Clone)]
pub struct FileStrategyStore {
    dir: PathBuf,
}

impl FileStrategyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parses a single file by extension.
    pub fn load_path(path: &Path) -> Result<RawStrategy> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => RawStrategy::from_toml(&content),
            _ => RawStrategy::from_json(&content),
        }
    }
}

impl StrategyStore for FileStrategyStore {
    fn load(&self, id: &str) -> Result<RawStrategy> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(Error::NotFound(id.to_string()));
        }
        for ext in ["json", "toml"] {
            let path = self.dir.join(format!("{id}.{ext}"));
            if path.is_file() {
                tracing::debug!(path = %path.display(), "Loading strategy file.");
                return Self::load_path(&path);
            }
        }
        Err(Error::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| matches!(path.extension().and_then(|e| e.to_str()), Some("json" | "toml")))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// In-process store, used by tests and by strategies submitted over the API.
#[derive(Debug, Default)]
pub struct MemoryStrategyStore {
    strategies: RwLock<HashMap<String, RawStrategy>>,
}

impl MemoryStrategyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, raw: RawStrategy) {
        if let Ok(mut map) = self.strategies.write() {
            map.insert(raw.id.clone(), raw);
        }
    }
}

impl StrategyStore for MemoryStrategyStore {
    fn load(&self, id: &str) -> Result<RawStrategy> {
        self.strategies
            .read()
            .ok()
            .and_then(|map| map.get(id).cloned())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .strategies
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strategy-store-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_store_reads_json_and_toml() {
        let dir = scratch_dir("formats");
        std::fs::write(dir.join("a.json"), r#"{"id":"a","name":"json one"}"#).unwrap();
        std::fs::write(dir.join("b.toml"), "id = \"b\"\nname = \"toml one\"\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let store = FileStrategyStore::new(&dir);
        assert_eq!(store.load("a").unwrap().name.as_deref(), Some("json one"));
        assert_eq!(store.load("b").unwrap().name.as_deref(), Some("toml one"));
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_store_rejects_missing_and_path_like_ids() {
        let dir = scratch_dir("missing");
        let store = FileStrategyStore::new(&dir);
        assert!(matches!(store.load("nope"), Err(Error::NotFound(_))));
        assert!(matches!(store.load("../etc/passwd"), Err(Error::NotFound(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_file_is_reported_as_malformed() {
        let dir = scratch_dir("malformed");
        std::fs::write(dir.join("bad.json"), "{ not json").unwrap();
        let store = FileStrategyStore::new(&dir);
        assert!(matches!(store.load("bad"), Err(Error::Malformed(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStrategyStore::new();
        store.insert(RawStrategy { id: "m".into(), ..Default::default() });
        assert_eq!(store.load("m").unwrap().id, "m");
        assert!(store.load("other").is_err());
        assert_eq!(store.list().unwrap(), vec!["m".to_string()]);
    }
}
