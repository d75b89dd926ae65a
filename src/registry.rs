//! Process-wide table of live pools
//!
//! The map is sharded, so a lookup or reconfiguration of one pool never
//! waits on another. Reconfigurations of the same pool are serialized by its
//! handle.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::ConfigListener;
use crate::error::{ExecutorError, RegistryError};
use crate::executor::{DynamicExecutor, PoolSample, Reconfiguration};
use crate::model::{ConfigEntry, GroupKey, NotifyAlarmConfig, PoolConfig};

/// One registered pool: its identity, live executor and alarm settings
pub struct PoolHandle {
    group_key: GroupKey,
    executor: DynamicExecutor,
    alarm: ArcSwap<NotifyAlarmConfig>,
    reconfigure_lock: Mutex<()>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("group_key", &self.group_key)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl PoolHandle {
    pub fn new(group_key: GroupKey, executor: DynamicExecutor, alarm: NotifyAlarmConfig) -> Self {
        Self {
            group_key,
            executor,
            alarm: ArcSwap::from_pointee(alarm),
            reconfigure_lock: Mutex::new(()),
        }
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    pub fn executor(&self) -> &DynamicExecutor {
        &self.executor
    }

    pub fn alarm(&self) -> Arc<NotifyAlarmConfig> {
        self.alarm.load_full()
    }

    /// Parameters and alarm settings currently in effect
    pub fn current_config(&self) -> PoolConfig {
        PoolConfig {
            parameters: self.executor.parameters(),
            alarm: NotifyAlarmConfig::clone(&self.alarm.load()),
        }
    }

    pub fn sample(&self) -> PoolSample {
        self.executor.sample()
    }

    /// Apply a whole pool document. Nothing changes if any part is invalid.
    pub fn reconfigure(&self, config: &PoolConfig) -> Result<Reconfiguration, ExecutorError> {
        config.validate()?;

        let _serial = self.reconfigure_lock.lock();
        let outcome = self.executor.reconfigure(&config.parameters)?;
        if **self.alarm.load() != config.alarm {
            self.alarm.store(Arc::new(config.alarm.clone()));
            debug!(pool = %self.group_key, "alarm settings replaced");
        }
        Ok(outcome)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PoolRegistry {
    pools: Arc<DashMap<GroupKey, Arc<PoolHandle>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool; fails if its key is taken.
    pub fn register(&self, handle: PoolHandle) -> Result<Arc<PoolHandle>, RegistryError> {
        match self.pools.entry(handle.group_key.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateRegistration(entry.key().clone())),
            Entry::Vacant(entry) => {
                let handle = Arc::new(handle);
                entry.insert(Arc::clone(&handle));
                debug!(pool = %handle.group_key, "pool registered");
                Ok(handle)
            }
        }
    }

    /// Add or swap a pool (hot reload). Returns the handle it replaced.
    pub fn replace(&self, handle: PoolHandle) -> Option<Arc<PoolHandle>> {
        let key = handle.group_key.clone();
        let previous = self.pools.insert(key.clone(), Arc::new(handle));
        if previous.is_some() {
            info!(pool = %key, "pool handle replaced");
        }
        previous
    }

    pub fn lookup(&self, key: &GroupKey) -> Result<Arc<PoolHandle>, RegistryError> {
        self.pools
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NotFound(key.clone()))
    }

    pub fn unregister(&self, key: &GroupKey) -> Result<Arc<PoolHandle>, RegistryError> {
        self.pools
            .remove(key)
            .map(|(_, handle)| handle)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))
    }

    pub fn keys(&self) -> Vec<GroupKey> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn handles(&self) -> Vec<Arc<PoolHandle>> {
        self.pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Applies pulled configuration to the matching registered pool.
#[derive(Debug, Clone)]
pub struct RegistryListener {
    registry: PoolRegistry,
}

impl RegistryListener {
    pub fn new(registry: PoolRegistry) -> Self {
        Self { registry }
    }
}

impl ConfigListener for RegistryListener {
    fn on_change(&self, entry: &ConfigEntry) {
        let handle = match self.registry.lookup(&entry.group_key) {
            Ok(handle) => handle,
            Err(e) => {
                // subscription outlived its pool
                warn!("{e}, dropping version {}", entry.version);
                return;
            }
        };

        let config = match PoolConfig::from_content(&entry.content) {
            Ok(config) => config,
            Err(e) => {
                warn!(pool = %entry.group_key, version = entry.version, "ignoring invalid content: {e}");
                return;
            }
        };

        match handle.reconfigure(&config) {
            Ok(outcome) => {
                info!(pool = %entry.group_key, version = entry.version, ?outcome, "applied configuration")
            }
            Err(e) => warn!(pool = %entry.group_key, version = entry.version, "reconfigure failed: {e}"),
        }
    }
}
