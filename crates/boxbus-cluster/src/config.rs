//! Replicated section/key/value configuration
//!
//! The store holds `configs/<section>/<key>` entries; each process keeps
//! an in-memory mirror that is rebuilt wholesale after every change
//! notification and swapped in atomically. Writes go through the store
//! first, conditionally against the mirror's last-known value, and touch
//! the mirror only once the store has confirmed them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use boxbus_common::{ClusterError, Result, canonical_json, validate_name};

use crate::store::{
    DeleteOptions, ReadOptions, StoreClient, StoreResponse, WriteOptions, relative_segments,
};
use crate::watch::WatchHandler;

/// One full configuration snapshot: section name to key/value mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SharedConfig {
    sections: HashMap<String, HashMap<String, Value>>,
}

impl SharedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn delete(&mut self, section: &str, key: &str) -> Option<Value> {
        self.sections.get_mut(section)?.remove(key)
    }

    pub fn delete_section(&mut self, section: &str) -> Option<HashMap<String, Value>> {
        self.sections.remove(section)
    }

    pub fn clear(&mut self) {
        self.sections.clear();
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)
    }

    /// First hit for `key` across `sections`, in order.
    pub fn get_chain(&self, sections: &[&str], key: &str) -> Option<&Value> {
        sections.iter().find_map(|section| self.get(section, key))
    }

    pub fn get_section(&self, section: &str) -> Option<&HashMap<String, Value>> {
        self.sections.get(section)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn has_key(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// All `(section, key, value)` entries, sorted by section then key.
    pub fn triple_items(&self) -> Vec<(String, String, Value)> {
        let mut triples: Vec<(String, String, Value)> = self
            .sections
            .iter()
            .flat_map(|(section, entries)| {
                entries
                    .iter()
                    .map(|(key, value)| (section.clone(), key.clone(), value.clone()))
            })
            .collect();
        triples.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        triples
    }

    pub fn dump_json(&self) -> String {
        serde_json::to_string_pretty(&self.sections).unwrap_or_default()
    }
}

/// Canonical `(section, key, value)` triple used by snapshot diffing.
pub type ConfigTriple = (String, String, String);

/// Diff two snapshots into `(will_delete, will_add)` triples.
///
/// An entry whose value changed appears only in `will_add`, so a
/// consumer applying the diff never deletes a key it is about to
/// rewrite.
pub fn compare_sections(
    old: &SharedConfig,
    new: &SharedConfig,
) -> (BTreeSet<ConfigTriple>, BTreeSet<ConfigTriple>) {
    let canonical_triples = |config: &SharedConfig| -> BTreeSet<ConfigTriple> {
        config
            .triple_items()
            .into_iter()
            .map(|(section, key, value)| (section, key, canonical_json(&value)))
            .collect()
    };

    let old_set = canonical_triples(old);
    let new_set = canonical_triples(new);

    let will_add: BTreeSet<ConfigTriple> = new_set.difference(&old_set).cloned().collect();
    let added_keys: BTreeSet<(&str, &str)> = will_add
        .iter()
        .map(|(section, key, _)| (section.as_str(), key.as_str()))
        .collect();

    let will_delete: BTreeSet<ConfigTriple> = old_set
        .difference(&new_set)
        .filter(|(section, key, _)| !added_keys.contains(&(section.as_str(), key.as_str())))
        .cloned()
        .collect();

    (will_delete, will_add)
}

/// Store-backed configuration with an atomically swapped local mirror.
pub struct ConfigStore {
    client: Arc<StoreClient>,
    mirror: RwLock<Arc<SharedConfig>>,
}

impl ConfigStore {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self {
            client,
            mirror: RwLock::new(Arc::new(SharedConfig::new())),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<SharedConfig> {
        self.mirror.read().clone()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<Value> {
        self.snapshot().get(section, key).cloned()
    }

    fn path(section: &str, key: &str) -> String {
        format!("configs/{}/{}", section, key)
    }

    fn swap_with<F>(&self, mutate: F)
    where
        F: FnOnce(&mut SharedConfig),
    {
        let mut next = (*self.snapshot()).clone();
        mutate(&mut next);
        *self.mirror.write() = Arc::new(next);
    }

    /// Conditionally write one value: the store must still hold the
    /// mirror's last-known value (or no value at all). The mirror is
    /// updated only after the store confirms.
    pub async fn set(&self, section: &str, key: &str, value: Value) -> Result<()> {
        validate_name("section", section)?;
        validate_name("key", key)?;

        let previous = self.get(section, key);
        let options = match &previous {
            Some(prev) => WriteOptions {
                prev_value: Some(canonical_json(prev)),
                ..Default::default()
            },
            None => WriteOptions {
                prev_exist: Some(false),
                ..Default::default()
            },
        };

        self.client
            .write(&Self::path(section, key), &canonical_json(&value), options)
            .await?;
        self.swap_with(|config| config.set(section, key, value));
        Ok(())
    }

    /// Delete one key; the store goes first, the mirror follows on
    /// confirmed success. A key already gone counts as success.
    pub async fn delete(&self, section: &str, key: &str) -> Result<()> {
        validate_name("section", section)?;
        validate_name("key", key)?;

        match self
            .client
            .delete(&Self::path(section, key), DeleteOptions::default())
            .await
        {
            Ok(_) | Err(ClusterError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.swap_with(|config| {
            config.delete(section, key);
        });
        Ok(())
    }

    pub async fn delete_section(&self, section: &str) -> Result<()> {
        validate_name("section", section)?;

        match self
            .client
            .delete(&format!("configs/{}", section), DeleteOptions { recursive: true })
            .await
        {
            Ok(_) | Err(ClusterError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.swap_with(|config| {
            config.delete_section(section);
        });
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match self
            .client
            .delete("configs", DeleteOptions { recursive: true })
            .await
        {
            Ok(_) | Err(ClusterError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        *self.mirror.write() = Arc::new(SharedConfig::new());
        Ok(())
    }

    /// Rebuild the mirror from a full recursive read and swap it in.
    /// An absent `configs/` subtree yields an empty snapshot.
    pub async fn refresh(&self) -> Result<()> {
        let mut next = SharedConfig::new();

        match self
            .client
            .read("configs", ReadOptions { recursive: true, ..Default::default() })
            .await
        {
            Ok(resp) => {
                let root_key = self.client.path("configs");
                for node in resp.node.leaves() {
                    let Some(value) = &node.value else { continue };
                    let Some(segments) = relative_segments(&root_key, &node.key) else {
                        continue;
                    };
                    let [section, key] = segments.as_slice() else { continue };
                    match serde_json::from_str::<Value>(value) {
                        Ok(parsed) => next.set(section, key, parsed),
                        Err(e) => warn!(key = %node.key, "skipping malformed config value: {}", e),
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        debug!("config mirror rebuilt");
        *self.mirror.write() = Arc::new(next);
        Ok(())
    }
}

#[async_trait]
impl WatchHandler for ConfigStore {
    async fn on_event(&self, _event: Option<StoreResponse>) {
        if let Err(e) = self.refresh().await {
            debug!("config refresh deferred: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreBackend};
    use serde_json::json;

    fn config_of(entries: &[(&str, &str, Value)]) -> SharedConfig {
        let mut config = SharedConfig::new();
        for (section, key, value) in entries {
            config.set(section, key, value.clone());
        }
        config
    }

    fn triple(section: &str, key: &str, value: &str) -> ConfigTriple {
        (section.to_string(), key.to_string(), value.to_string())
    }

    #[test]
    fn test_compare_sections_changed_value_only_added() {
        let old = config_of(&[("s", "a", json!("1"))]);
        let new = config_of(&[("s", "a", json!("2"))]);

        let (will_delete, will_add) = compare_sections(&old, &new);
        assert!(will_delete.is_empty());
        assert_eq!(will_add, BTreeSet::from([triple("s", "a", "\"2\"")]));
    }

    #[test]
    fn test_compare_sections_removed_key() {
        let old = config_of(&[("s", "a", json!("1")), ("s", "b", json!("2"))]);
        let new = config_of(&[("s", "a", json!("1"))]);

        let (will_delete, will_add) = compare_sections(&old, &new);
        assert_eq!(will_delete, BTreeSet::from([triple("s", "b", "\"2\"")]));
        assert!(will_add.is_empty());
    }

    #[test]
    fn test_compare_sections_equal_snapshots() {
        let old = config_of(&[("s", "a", json!({"x": 1, "y": 2}))]);
        let new = config_of(&[("s", "a", json!({"y": 2, "x": 1}))]);

        let (will_delete, will_add) = compare_sections(&old, &new);
        assert!(will_delete.is_empty());
        assert!(will_add.is_empty());
    }

    #[test]
    fn test_shared_config_accessors() {
        let config = config_of(&[
            ("db", "host", json!("h1")),
            ("db", "port", json!(5432)),
            ("web", "host", json!("h2")),
        ]);

        assert_eq!(config.get("db", "host"), Some(&json!("h1")));
        assert!(config.has_section("web"));
        assert!(!config.has_key("web", "port"));
        assert_eq!(config.get_chain(&["missing", "web"], "host"), Some(&json!("h2")));
        assert_eq!(config.get_chain(&["nope"], "host"), None);

        let triples = config.triple_items();
        assert_eq!(triples.len(), 3);
        assert_eq!(triples[0].0, "db");
        assert_eq!(triples[0].1, "host");
    }

    fn setup() -> (Arc<MemoryStore>, Arc<StoreClient>) {
        let backend = Arc::new(MemoryStore::new());
        let client = Arc::new(StoreClient::new(backend.clone(), "bbox"));
        (backend, client)
    }

    #[tokio::test]
    async fn test_set_writes_store_then_mirror() {
        let (backend, client) = setup();
        let config = ConfigStore::new(client);

        config.set("db", "host", json!("h1")).await.unwrap();
        assert_eq!(config.get("db", "host"), Some(json!("h1")));

        let resp = backend.read("/bbox/configs/db/host", ReadOptions::default()).await.unwrap();
        assert_eq!(resp.node.value.as_deref(), Some("\"h1\""));

        // Update goes through compare-and-swap against the known value.
        config.set("db", "host", json!("h2")).await.unwrap();
        assert_eq!(config.get("db", "host"), Some(json!("h2")));
    }

    #[tokio::test]
    async fn test_set_fails_when_store_has_diverged() {
        let (backend, client) = setup();
        let config = ConfigStore::new(client);
        config.set("db", "host", json!("h1")).await.unwrap();

        // Someone else rewrote the store behind our back.
        backend
            .write("/bbox/configs/db/host", "\"other\"", WriteOptions::default())
            .await
            .unwrap();

        let err = config.set("db", "host", json!("h2")).await.unwrap_err();
        assert!(matches!(err, ClusterError::CasFailed(_)));
        // Mirror keeps its pre-write value.
        assert_eq!(config.get("db", "host"), Some(json!("h1")));
    }

    #[tokio::test]
    async fn test_first_set_requires_absent_key() {
        let (backend, client) = setup();
        let config = ConfigStore::new(client);

        backend
            .write("/bbox/configs/db/host", "\"taken\"", WriteOptions::default())
            .await
            .unwrap();

        let err = config.set("db", "host", json!("h1")).await.unwrap_err();
        assert!(matches!(err, ClusterError::CasFailed(_)));
        assert_eq!(config.get("db", "host"), None);
    }

    #[tokio::test]
    async fn test_set_failure_leaves_mirror_untouched() {
        let (backend, client) = setup();
        let config = ConfigStore::new(client);
        config.set("db", "host", json!("h1")).await.unwrap();

        backend.set_available(false);
        let err = config.set("db", "host", json!("h2")).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(config.get("db", "host"), Some(json!("h1")));
    }

    #[tokio::test]
    async fn test_delete_is_store_first() {
        let (backend, client) = setup();
        let config = ConfigStore::new(client);
        config.set("db", "host", json!("h1")).await.unwrap();

        backend.set_available(false);
        assert!(config.delete("db", "host").await.is_err());
        // Store refused, so the mirror still holds the value.
        assert_eq!(config.get("db", "host"), Some(json!("h1")));

        backend.set_available(true);
        config.delete("db", "host").await.unwrap();
        assert_eq!(config.get("db", "host"), None);
        assert!(
            backend
                .read("/bbox/configs/db/host", ReadOptions::default())
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_delete_section_and_clear() {
        let (_, client) = setup();
        let config = ConfigStore::new(client);
        config.set("db", "host", json!("h1")).await.unwrap();
        config.set("db", "port", json!(5432)).await.unwrap();
        config.set("web", "root", json!("/srv")).await.unwrap();

        config.delete_section("db").await.unwrap();
        assert!(!config.snapshot().has_section("db"));
        assert!(config.snapshot().has_section("web"));

        config.clear().await.unwrap();
        assert!(config.snapshot().is_empty());

        // Clearing an already-empty tree is fine.
        config.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let (backend, client) = setup();
        let config = ConfigStore::new(client);

        backend
            .write("/bbox/configs/db/host", "\"h1\"", WriteOptions::default())
            .await
            .unwrap();
        backend
            .write("/bbox/configs/db/port", "5432", WriteOptions::default())
            .await
            .unwrap();
        backend
            .write("/bbox/configs/web/flags", r#"{"gzip":true}"#, WriteOptions::default())
            .await
            .unwrap();

        config.refresh().await.unwrap();
        let snapshot = config.snapshot();
        assert_eq!(snapshot.get("db", "host"), Some(&json!("h1")));
        assert_eq!(snapshot.get("db", "port"), Some(&json!(5432)));
        assert_eq!(snapshot.get("web", "flags"), Some(&json!({"gzip": true})));

        // Absent subtree refreshes to empty.
        backend.delete("/bbox/configs", DeleteOptions { recursive: true }).await.unwrap();
        config.refresh().await.unwrap();
        assert!(config.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (_, client) = setup();
        let config = ConfigStore::new(client);

        assert!(matches!(
            config.set("a/b", "k", json!(1)).await.unwrap_err(),
            ClusterError::InvalidName(_)
        ));
        assert!(matches!(
            config.set("s", "", json!(1)).await.unwrap_err(),
            ClusterError::InvalidName(_)
        ));
        assert!(config.delete_section("a/b").await.is_err());
    }
}
