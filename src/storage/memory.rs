//! In-memory config store (no persistence)
//!
//! Used when no storage backend is configured and throughout the tests.
//! All data is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::digest::fingerprint;
use crate::model::{ConfigEntry, GroupKey};

use super::backend::{CHANGE_CHANNEL_CAPACITY, ConfigChange, ConfigStore};
use super::error::{StoreError, StoreResult};

pub struct MemoryConfigStore {
    entries: RwLock<HashMap<GroupKey, ConfigEntry>>,
    changes: broadcast::Sender<ConfigChange>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn new_entry(key: &GroupKey, content: &str, version: u64) -> ConfigEntry {
        ConfigEntry {
            group_key: key.clone(),
            content: content.to_string(),
            fingerprint: fingerprint(content),
            version,
            updated_at: Utc::now(),
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn write(&self, key: &GroupKey, content: &str) -> StoreResult<ConfigEntry> {
        let mut entries = self.entries.write();

        let version = match entries.get(key) {
            Some(current) if current.fingerprint == fingerprint(content) => {
                debug!(key = %key, "content unchanged, skipping write");
                return Ok(current.clone());
            }
            Some(current) => current.version + 1,
            None => 1,
        };

        let entry = Self::new_entry(key, content, version);
        entries.insert(key.clone(), entry.clone());

        // sent under the lock so subscribers see versions of a key in order
        let _ = self.changes.send(ConfigChange::from(&entry));
        debug!(key = %key, version, "stored new content");
        Ok(entry)
    }

    async fn insert_if_absent(
        &self,
        key: &GroupKey,
        content: &str,
    ) -> StoreResult<(ConfigEntry, bool)> {
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(key) {
            return Ok((current.clone(), false));
        }

        let entry = Self::new_entry(key, content, 1);
        entries.insert(key.clone(), entry.clone());
        let _ = self.changes.send(ConfigChange::from(&entry));
        Ok((entry, true))
    }

    async fn read(&self, key: &GroupKey) -> StoreResult<ConfigEntry> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        debug!("closing in-memory store (no-op)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Probe;
    use assert_matches::assert_matches;

    fn key(pool: &str) -> GroupKey {
        GroupKey::new("prod", "orders", pool).unwrap()
    }

    #[tokio::test]
    async fn test_write_bumps_version_and_notifies() {
        let store = MemoryConfigStore::new();
        let mut changes = store.subscribe();

        let first = store.write(&key("a"), r#"{"core_pool_size":1}"#).await.unwrap();
        let second = store.write(&key("a"), r#"{"core_pool_size":2}"#).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_ne!(first.fingerprint, second.fingerprint);

        assert_eq!(changes.recv().await.unwrap().version, 1);
        let change = changes.recv().await.unwrap();
        assert_eq!(change.version, 2);
        assert_eq!(change.fingerprint, second.fingerprint);
    }

    #[tokio::test]
    async fn test_identical_write_is_noop() {
        let store = MemoryConfigStore::new();
        store.write(&key("a"), r#"{"a":1,"b":2}"#).await.unwrap();
        let mut changes = store.subscribe();

        let again = store.write(&key("a"), r#"{"b":2,"a":1}"#).await.unwrap();
        assert_eq!(again.version, 1);
        assert_matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        );
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing() {
        let store = MemoryConfigStore::new();
        let (_, created) = store.insert_if_absent(&key("a"), "one").await.unwrap();
        assert!(created);

        let (entry, created) = store.insert_if_absent(&key("a"), "two").await.unwrap();
        assert!(!created);
        assert_eq!(entry.content, "one");
    }

    #[tokio::test]
    async fn test_read_unknown_key() {
        let store = MemoryConfigStore::new();
        assert_matches!(store.read(&key("a")).await, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fingerprints_since() {
        let store = MemoryConfigStore::new();
        let a = store.write(&key("a"), "one").await.unwrap();
        let b = store.write(&key("b"), "two").await.unwrap();

        let mut known = Probe::new();
        known.insert(key("a"), a.fingerprint.clone());
        known.insert(key("b"), "stale".to_string());
        known.insert(key("missing"), b.fingerprint);

        let changed = store.fingerprints_since(&known).await.unwrap();
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec![key("b"), key("missing")]);
    }
}
