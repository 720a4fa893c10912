//! File-backed [`DocumentStore`]: one JSON file per collection.

use super::store::{DocumentPatch, DocumentStore, Filter};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Hit-count patches buffered before the collection file is rewritten.
pub const DEFAULT_UPDATE_BATCH: usize = 16;

struct Collection {
    docs: Map<String, Value>,
    /// Patches applied in memory but not yet written.
    unflushed: usize,
}

/// Persists each collection as `<dir>/<collection>.json`.
///
/// Collections are loaded on first use and kept in memory. `put` and `delete`
/// are applied to a copy which replaces the in-memory collection only after
/// the file has been rewritten (temporary file, then rename), so a failed
/// write leaves both memory and disk at the previous version.
///
/// `update` patches (hit counters) are applied in memory and written once
/// every [`DEFAULT_UPDATE_BATCH`] patches, or earlier by the next `put` /
/// `delete` or an explicit [`JsonFileStore::sync`]. Patches still buffered
/// when the process stops are lost.
pub struct JsonFileStore {
    dir: PathBuf,
    collections: Mutex<HashMap<String, Collection>>,
    update_batch: usize,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            collections: Mutex::new(HashMap::new()),
            update_batch: DEFAULT_UPDATE_BATCH,
        })
    }

    /// Write the collection file after every `n` patches (1 = every patch).
    pub fn with_update_batch(mut self, n: usize) -> Self {
        self.update_batch = n.max(1);
        self
    }

    /// Write every collection that has buffered patches.
    pub async fn sync(&self) -> Result<()> {
        let mut cols = self.collections.lock().await;
        for (name, col) in cols.iter_mut() {
            if col.unflushed > 0 {
                self.flush(name, &col.docs).await?;
                col.unflushed = 0;
            }
        }
        Ok(())
    }

    fn path_for(&self, collection: &str) -> Result<PathBuf> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::persistence_with_context(
                "invalid collection name",
                ErrorContext::new()
                    .with_details(collection.to_string())
                    .with_source("json_file_store"),
            ));
        }
        Ok(self.dir.join(format!("{}.json", collection)))
    }

    async fn load(&self, collection: &str) -> Result<Map<String, Value>> {
        let path = self.path_for(collection)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(Error::persistence_with_context(
                    "collection file is not a JSON object",
                    ErrorContext::new()
                        .with_field_path(path.display().to_string())
                        .with_source("json_file_store"),
                )),
                Err(e) => Err(Error::persistence_with_context(
                    e.to_string(),
                    ErrorContext::new()
                        .with_field_path(path.display().to_string())
                        .with_source("json_file_store"),
                )),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self, collection: &str, docs: &Map<String, Value>) -> Result<()> {
        let path = self.path_for(collection)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(docs)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn loaded<'a>(
        &self,
        cols: &'a mut HashMap<String, Collection>,
        collection: &str,
    ) -> Result<&'a mut Collection> {
        if !cols.contains_key(collection) {
            let docs = self.load(collection).await?;
            cols.insert(
                collection.to_string(),
                Collection {
                    docs,
                    unflushed: 0,
                },
            );
        }
        cols.get_mut(collection).ok_or_else(|| {
            Error::persistence_with_context(
                "collection not loaded",
                ErrorContext::new().with_source("json_file_store"),
            )
        })
    }

    async fn read<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&Map<String, Value>) -> T,
    ) -> Result<T> {
        let mut cols = self.collections.lock().await;
        let col = self.loaded(&mut cols, collection).await?;
        Ok(f(&col.docs))
    }

    /// Apply `f` to a copy of the collection; when it reports a change the
    /// copy is written and only then replaces the in-memory version.
    async fn write<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Map<String, Value>) -> (T, bool),
    ) -> Result<T> {
        let mut cols = self.collections.lock().await;
        let col = self.loaded(&mut cols, collection).await?;
        let mut draft = col.docs.clone();
        let (out, dirty) = f(&mut draft);
        if dirty {
            self.flush(collection, &draft).await?;
            col.docs = draft;
            col.unflushed = 0;
        }
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.read(collection, |docs| docs.get(id).cloned()).await
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        self.write(collection, |docs| {
            docs.insert(id.to_string(), doc);
            ((), true)
        })
        .await
    }

    async fn update(&self, collection: &str, id: &str, patch: &DocumentPatch) -> Result<bool> {
        let mut cols = self.collections.lock().await;
        let col = self.loaded(&mut cols, collection).await?;
        let Some(doc) = col.docs.get_mut(id) else {
            return Ok(false);
        };
        patch.apply(doc);
        col.unflushed += 1;
        if col.unflushed >= self.update_batch {
            // On failure the patches stay buffered for the next write.
            self.flush(collection, &col.docs).await?;
            col.unflushed = 0;
        }
        Ok(true)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.write(collection, |docs| {
            let removed = docs.remove(id).is_some();
            (removed, removed)
        })
        .await
    }

    async fn query_where(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Value)>> {
        self.read(collection, |docs| {
            docs.iter()
                .filter(|(_, doc)| filter.matches(doc))
                .map(|(id, doc)| (id.clone(), doc.clone()))
                .collect()
        })
        .await
    }

    async fn scan(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        self.read(collection, |docs| {
            docs.iter()
                .map(|(id, doc)| (id.clone(), doc.clone()))
                .collect()
        })
        .await
    }

    fn name(&self) -> &'static str {
        "json_file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store.put("cache", "a", json!({"hit_count": 0})).await.unwrap();
            store
                .update("cache", "a", &DocumentPatch::new().increment("hit_count", 2))
                .await
                .unwrap();
            store.put("cache", "b", json!({"hit_count": 0})).await.unwrap();
            assert!(store.delete("cache", "b").await.unwrap());
        }
        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        let doc = reopened.get("cache", "a").await.unwrap().unwrap();
        assert_eq!(doc["hit_count"], 2);
        assert!(reopened.get("cache", "b").await.unwrap().is_none());
        assert!(dir.path().join("cache.json").exists());
        assert!(!dir.path().join("cache.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store.put("cache", "a", json!({"n": 1})).await.unwrap();

        // A directory in the temp-file slot makes every write fail, even as root.
        std::fs::create_dir(dir.path().join("cache.json.tmp")).unwrap();
        assert!(store.put("cache", "b", json!({"n": 2})).await.is_err());
        assert!(store.delete("cache", "a").await.is_err());

        assert!(store.get("cache", "b").await.unwrap().is_none());
        assert!(store.get("cache", "a").await.unwrap().is_some());

        std::fs::remove_dir(dir.path().join("cache.json.tmp")).unwrap();
        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(reopened.get("cache", "b").await.unwrap().is_none());
        assert!(reopened.get("cache", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_store_is_a_miss() {
        use crate::cache::key::fingerprint;
        use crate::cache::{CacheConfig, CacheType, GenerationCache};
        use crate::clock::SystemClock;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
        let cache = GenerationCache::new(CacheConfig::default(), store, Arc::new(SystemClock));
        std::fs::create_dir(dir.path().join("generation_cache.json.tmp")).unwrap();

        let fp = fingerprint(&json!({"resume": "R1"})).unwrap();
        assert!(!cache.store("k", &CacheType::Score, &fp, "{}", None).await);
        assert!(!cache.lookup("k", &fp).await.is_hit());
    }

    #[tokio::test]
    async fn test_hit_patches_are_batched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = JsonFileStore::open(dir.path())
            .await
            .unwrap()
            .with_update_batch(3);
        store.put("cache", "a", json!({"hit_count": 0})).await.unwrap();
        let on_disk = || {
            let v: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            v["a"]["hit_count"].as_i64().unwrap()
        };

        let bump = DocumentPatch::new().increment("hit_count", 1);
        store.update("cache", "a", &bump).await.unwrap();
        store.update("cache", "a", &bump).await.unwrap();
        assert_eq!(on_disk(), 0);
        assert_eq!(store.get("cache", "a").await.unwrap().unwrap()["hit_count"], 2);

        store.update("cache", "a", &bump).await.unwrap();
        assert_eq!(on_disk(), 3);

        store.update("cache", "a", &bump).await.unwrap();
        store.sync().await.unwrap();
        assert_eq!(on_disk(), 4);
    }

    #[tokio::test]
    async fn test_rejects_path_like_collection_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let err = store.get("../escape", "a").await.unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cache.json"), b"[not json").unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get("cache", "a").await,
            Err(Error::Persistence { .. })
        ));
    }
}
