//! Long-poll coordinator
//!
//! A poll whose keys are all up to date is parked: it is indexed under every
//! key it watches and waits on a oneshot channel with a timer. No thread is
//! tied up while a poll is parked.
//!
//! A parked poll resolves exactly once. The sender sits in a mutex-guarded
//! slot and whoever takes it first (the change watcher or the expiring
//! poller) decides the answer.
//!
//! ```text
//! poll ──► compare ──changed──► respond now
//!             │
//!           equal ──► park ──► re-compare ──changed──► unpark, respond
//!                        │
//!                        ├── write to a watched key ──► respond {key}
//!                        └── hold expired ──► respond {}
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::model::GroupKey;
use crate::protocol::Probe;
use crate::storage::{ConfigChange, ConfigStore, StoreResult};

type ChangedKeys = BTreeSet<GroupKey>;

struct ParkedPoll {
    id: u64,
    probe: Probe,
    slot: Mutex<Option<oneshot::Sender<ChangedKeys>>>,
}

impl ParkedPoll {
    /// Resolve the poll unless someone else already did.
    fn resolve(&self, changed: ChangedKeys) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                let _ = tx.send(changed);
                true
            }
            None => false,
        }
    }
}

/// Removes a parked poll from the index when the poll returns or its future
/// is dropped.
struct Unpark<'a> {
    coordinator: &'a LongPollCoordinator,
    poll: &'a ParkedPoll,
}

impl Drop for Unpark<'_> {
    fn drop(&mut self) {
        self.coordinator.unpark(self.poll);
    }
}

pub struct LongPollCoordinator {
    store: Arc<dyn ConfigStore>,
    parked: DashMap<GroupKey, HashMap<u64, Arc<ParkedPoll>>>,
    next_id: AtomicU64,
    max_hold: Duration,
}

impl LongPollCoordinator {
    pub fn new(store: Arc<dyn ConfigStore>, max_hold: Duration) -> Self {
        Self {
            store,
            parked: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_hold,
        }
    }

    pub fn max_hold(&self) -> Duration {
        self.max_hold
    }

    /// Number of polls currently parked
    pub fn parked_count(&self) -> usize {
        let ids: BTreeSet<u64> = self
            .parked
            .iter()
            .flat_map(|entry| entry.value().keys().copied().collect::<Vec<_>>())
            .collect();
        ids.len()
    }

    /// Answer a poll with the keys whose fingerprints changed, waiting up to
    /// `hold` (capped at the configured maximum) for one to change.
    ///
    /// Keys outside `tenant` are reported as changed right away.
    #[instrument(skip(self, probe), fields(keys = probe.len()))]
    pub async fn poll(
        &self,
        probe: Probe,
        tenant: Option<&str>,
        hold: Duration,
    ) -> StoreResult<ChangedKeys> {
        if probe.is_empty() {
            return Ok(ChangedKeys::new());
        }

        let mut changed = self.store.fingerprints_since(&probe).await?;
        if let Some(tenant) = tenant {
            changed.extend(probe.keys().filter(|key| key.tenant() != tenant).cloned());
        }
        if !changed.is_empty() {
            trace!(changed = changed.len(), "answering immediately");
            return Ok(changed);
        }

        let (tx, mut rx) = oneshot::channel();
        let parked = Arc::new(ParkedPoll {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            probe,
            slot: Mutex::new(Some(tx)),
        });
        self.park(&parked);
        let _parked = Unpark {
            coordinator: self,
            poll: &parked,
        };

        // a write between the first compare and parking would be missed otherwise
        let changed = self.store.fingerprints_since(&parked.probe).await?;
        if !changed.is_empty() {
            return Ok(changed);
        }

        let hold = hold.min(self.max_hold);
        match tokio::time::timeout(hold, &mut rx).await {
            Ok(result) => Ok(result.unwrap_or_default()),
            Err(_) if parked.resolve(ChangedKeys::new()) => {
                trace!("hold expired without changes");
                Ok(ChangedKeys::new())
            }
            // the watcher won the race; its answer is already in flight
            Err(_) => Ok(rx.await.unwrap_or_default()),
        }
    }

    fn park(&self, poll: &Arc<ParkedPoll>) {
        for key in poll.probe.keys() {
            self.parked
                .entry(key.clone())
                .or_default()
                .insert(poll.id, Arc::clone(poll));
        }
    }

    fn unpark(&self, poll: &ParkedPoll) {
        for key in poll.probe.keys() {
            if let Some(mut polls) = self.parked.get_mut(key) {
                polls.remove(&poll.id);
            }
            self.parked.remove_if(key, |_, polls| polls.is_empty());
        }
    }

    fn polls_on(&self, key: &GroupKey) -> Vec<Arc<ParkedPoll>> {
        self.parked
            .get(key)
            .map(|polls| polls.values().cloned().collect())
            .unwrap_or_default()
    }

    fn all_polls(&self) -> Vec<Arc<ParkedPoll>> {
        let mut by_id = HashMap::new();
        for entry in self.parked.iter() {
            for (id, poll) in entry.value() {
                by_id.insert(*id, Arc::clone(poll));
            }
        }
        by_id.into_values().collect()
    }

    fn on_change(&self, change: &ConfigChange) {
        let mut woken = 0;
        for poll in self.polls_on(&change.group_key) {
            if poll.probe.get(&change.group_key) == Some(&change.fingerprint) {
                continue;
            }
            let changed = ChangedKeys::from([change.group_key.clone()]);
            if poll.resolve(changed) {
                woken += 1;
            }
        }
        if woken > 0 {
            debug!(key = %change.group_key, version = change.version, woken, "woke parked polls");
        }
    }

    /// Missed notifications: compare every parked poll against the store.
    async fn recheck_all(&self) {
        for poll in self.all_polls() {
            match self.store.fingerprints_since(&poll.probe).await {
                Ok(changed) if !changed.is_empty() => {
                    poll.resolve(changed);
                }
                Ok(_) => {}
                Err(e) => warn!("failed to re-check parked poll: {e}"),
            }
        }
    }

    /// Run the change watcher until cancelled or the store goes away.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("starting long-poll watcher");
        let mut changes = self.store.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("received shutdown");
                    break;
                }

                result = changes.recv() => {
                    match result {
                        Ok(change) => self.on_change(&change),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("long-poll watcher lagged, skipped {skipped} changes");
                            self.recheck_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("change channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("long-poll watcher stopped");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryConfigStore;
    use pretty_assertions::assert_eq;

    fn key(pool: &str) -> GroupKey {
        GroupKey::new("prod", "orders", pool).unwrap()
    }

    async fn setup() -> (Arc<MemoryConfigStore>, Arc<LongPollCoordinator>, CancellationToken) {
        let store = Arc::new(MemoryConfigStore::new());
        let coordinator = Arc::new(LongPollCoordinator::new(
            store.clone(),
            Duration::from_secs(30),
        ));
        let cancel = CancellationToken::new();
        coordinator.spawn(cancel.clone());
        (store, coordinator, cancel)
    }

    async fn probe_for(store: &MemoryConfigStore, pool: &str) -> Probe {
        let entry = store.write(&key(pool), pool).await.unwrap();
        Probe::from([(key(pool), entry.fingerprint)])
    }

    #[tokio::test]
    async fn test_empty_probe_answers_immediately() {
        let (_store, coordinator, _cancel) = setup().await;
        let changed = coordinator
            .poll(Probe::new(), None, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_stale_fingerprint_answers_immediately() {
        let (store, coordinator, _cancel) = setup().await;
        store.write(&key("a"), "one").await.unwrap();

        let probe = Probe::from([(key("a"), "old".to_string())]);
        let changed = coordinator
            .poll(probe, None, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(changed, ChangedKeys::from([key("a")]));
    }

    #[tokio::test]
    async fn test_foreign_tenant_counts_as_changed() {
        let (store, coordinator, _cancel) = setup().await;
        let probe = probe_for(&store, "a").await;

        let changed = coordinator
            .poll(probe, Some("staging"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(changed, ChangedKeys::from([key("a")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_poll_times_out_empty() {
        let (store, coordinator, _cancel) = setup().await;
        let probe = probe_for(&store, "a").await;

        let started = tokio::time::Instant::now();
        let changed = coordinator
            .poll(probe, Some("prod"), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(changed.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(coordinator.parked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_is_capped() {
        let store = Arc::new(MemoryConfigStore::new());
        let coordinator = LongPollCoordinator::new(store.clone(), Duration::from_secs(5));
        let probe = probe_for(&store, "a").await;

        let started = tokio::time::Instant::now();
        coordinator
            .poll(probe, None, Duration::from_secs(60))
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_write_wakes_parked_poll() {
        let (store, coordinator, _cancel) = setup().await;
        let mut probe = probe_for(&store, "a").await;
        probe.extend(probe_for(&store, "b").await);

        let poller = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .poll(probe, None, Duration::from_secs(30))
                    .await
            })
        };

        while coordinator.parked_count() == 0 {
            tokio::task::yield_now().await;
        }
        store.write(&key("b"), "changed").await.unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), poller)
            .await
            .expect("poll should resolve before the hold expires")
            .unwrap()
            .unwrap();
        assert_eq!(changed, ChangedKeys::from([key("b")]));
        assert_eq!(coordinator.parked_count(), 0);
    }

    #[tokio::test]
    async fn test_write_to_other_key_does_not_wake() {
        let (store, coordinator, _cancel) = setup().await;
        let probe = probe_for(&store, "a").await;

        let poller = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .poll(probe, None, Duration::from_millis(300))
                    .await
            })
        };
        while coordinator.parked_count() == 0 {
            tokio::task::yield_now().await;
        }
        store.write(&key("other"), "x").await.unwrap();

        let changed = poller.await.unwrap().unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_poll_is_unparked() {
        let (store, coordinator, _cancel) = setup().await;
        let mut probe = probe_for(&store, "a").await;
        probe.extend(probe_for(&store, "b").await);

        let poller = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .poll(probe, None, Duration::from_secs(30))
                    .await
            })
        };
        while coordinator.parked_count() == 0 {
            tokio::task::yield_now().await;
        }

        poller.abort();
        assert!(poller.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.parked_count(), 0);
        assert!(coordinator.parked.is_empty());
    }

    #[tokio::test]
    async fn test_parked_poll_resolves_once() {
        let poll = ParkedPoll {
            id: 1,
            probe: Probe::new(),
            slot: Mutex::new(None),
        };
        let (tx, rx) = oneshot::channel();
        *poll.slot.lock() = Some(tx);

        assert!(poll.resolve(ChangedKeys::from([key("a")])));
        assert!(!poll.resolve(ChangedKeys::new()));
        assert_eq!(rx.await.unwrap(), ChangedKeys::from([key("a")]));
    }
}
