//! Config store trait definition

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::model::{ConfigEntry, GroupKey};
use crate::protocol::Probe;

use super::error::{StoreError, StoreResult};

/// Capacity of the change broadcast channel of every store
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Emitted after a write committed a new version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub group_key: GroupKey,
    pub version: u64,
    pub fingerprint: String,
}

impl From<&ConfigEntry> for ConfigChange {
    fn from(entry: &ConfigEntry) -> Self {
        Self {
            group_key: entry.group_key.clone(),
            version: entry.version,
            fingerprint: entry.fingerprint.clone(),
        }
    }
}

/// Authoritative `group key -> (content, fingerprint, version)` mapping.
///
/// Every backend drives the same write-then-notify path: a write commits
/// content, fingerprint and version together and only then publishes a
/// [`ConfigChange`] to subscribers.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; the HTTP handlers and the long-poll
/// coordinator share one store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Store new content for a key and return the resulting entry.
    ///
    /// Content whose fingerprint equals the stored one is a no-op: the
    /// version does not move and nobody is notified.
    async fn write(&self, key: &GroupKey, content: &str) -> StoreResult<ConfigEntry>;

    /// Store content only if the key is unknown.
    ///
    /// Returns the stored entry and whether it was created by this call.
    async fn insert_if_absent(&self, key: &GroupKey, content: &str)
    -> StoreResult<(ConfigEntry, bool)>;

    async fn read(&self, key: &GroupKey) -> StoreResult<ConfigEntry>;

    /// Keys whose stored fingerprint differs from the known one.
    ///
    /// Unknown keys count as changed so the client pulls and fails cleanly
    /// instead of waiting on a key that does not exist yet.
    async fn fingerprints_since(&self, known: &Probe) -> StoreResult<BTreeSet<GroupKey>> {
        let mut changed = BTreeSet::new();
        for (key, fingerprint) in known {
            match self.read(key).await {
                Ok(entry) if entry.fingerprint == *fingerprint => {}
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    changed.insert(key.clone());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange>;

    /// Lightweight operational check
    async fn health_check(&self) -> StoreResult<()>;

    async fn close(&self) -> StoreResult<()>;
}
