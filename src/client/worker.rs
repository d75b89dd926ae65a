//! Client worker: the one poll loop of a client process
//!
//! ```text
//! subscriptions ──► probe ──► long poll ──► changed keys ──► pull each
//!       ▲                                                      │
//!       └──── fingerprint / version updated ◄── listener ◄─────┘
//! ```
//!
//! Transport failures back off exponentially up to a cap and retry the same
//! probe; nothing is lost because fingerprints only move after a pull.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ClientError, TransportError};
use crate::model::{ConfigEntry, GroupKey};
use crate::protocol::{DEFAULT_HOLD, DEFAULT_TIMEOUT_MARGIN, Probe};

use super::agent::ServerAgent;

/// Receives new content for one subscribed key.
///
/// Must be idempotent: a retried notification can replay content.
pub trait ConfigListener: Send + Sync {
    fn on_change(&self, entry: &ConfigEntry);
}

impl<F> ConfigListener for F
where
    F: Fn(&ConfigEntry) + Send + Sync,
{
    fn on_change(&self, entry: &ConfigEntry) {
        self(entry)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub hold: Duration,
    pub timeout_margin: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures logged as warnings before escalating
    pub retry_budget: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            hold: DEFAULT_HOLD,
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_millis(30_000),
            retry_budget: 10,
        }
    }
}

struct Subscription {
    known_fingerprint: String,
    applied_version: u64,
    listener: Arc<dyn ConfigListener>,
}

/// What one poll cycle did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub changed: usize,
    pub applied: usize,
    /// Changed keys the server has no content for
    pub missing: usize,
}

pub struct ClientWorker {
    agent: ServerAgent,
    subscriptions: DashMap<GroupKey, Subscription>,
    settings: WorkerSettings,
    resubscribed: Notify,
}

impl ClientWorker {
    pub fn new(agent: ServerAgent, settings: WorkerSettings) -> Self {
        Self {
            agent,
            subscriptions: DashMap::new(),
            settings,
            resubscribed: Notify::new(),
        }
    }

    /// Watch `key`, starting from the content the caller already runs with.
    pub fn subscribe(
        &self,
        key: GroupKey,
        known_fingerprint: impl Into<String>,
        listener: Arc<dyn ConfigListener>,
    ) {
        self.subscriptions.insert(
            key,
            Subscription {
                known_fingerprint: known_fingerprint.into(),
                applied_version: 0,
                listener,
            },
        );
        // restart a parked poll so it includes the new key
        self.resubscribed.notify_one();
    }

    pub fn unsubscribe(&self, key: &GroupKey) -> bool {
        let removed = self.subscriptions.remove(key).is_some();
        if removed {
            self.resubscribed.notify_one();
        }
        removed
    }

    pub fn known_fingerprint(&self, key: &GroupKey) -> Option<String> {
        self.subscriptions
            .get(key)
            .map(|sub| sub.known_fingerprint.clone())
    }

    pub fn probe(&self) -> Probe {
        self.subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.known_fingerprint.clone()))
            .collect()
    }

    /// Hand pulled content to the key's listener.
    ///
    /// Returns `Ok(false)` when the content matches what is already applied.
    /// Versions not newer than the last applied one are refused.
    pub fn apply(&self, entry: &ConfigEntry) -> Result<bool, ClientError> {
        let listener = {
            let mut sub = self
                .subscriptions
                .get_mut(&entry.group_key)
                .ok_or_else(|| ClientError::NotSubscribed(entry.group_key.clone()))?;

            if entry.version <= sub.applied_version {
                return Err(ClientError::StaleNotification {
                    key: entry.group_key.clone(),
                    pulled: entry.version,
                    applied: sub.applied_version,
                });
            }

            sub.applied_version = entry.version;
            if sub.known_fingerprint == entry.fingerprint {
                return Ok(false);
            }
            sub.known_fingerprint = entry.fingerprint.clone();
            Arc::clone(&sub.listener)
        };

        // invoked without holding the map shard
        listener.on_change(entry);
        Ok(true)
    }

    /// Pull every changed key and apply it. Stops at the first transport
    /// failure; keys not yet pulled are reported again by the next poll.
    pub async fn pull_and_apply(
        &self,
        changed: BTreeSet<GroupKey>,
    ) -> Result<PollOutcome, TransportError> {
        let mut outcome = PollOutcome {
            changed: changed.len(),
            ..Default::default()
        };

        for key in changed {
            let entry = match self.agent.pull(&key).await {
                Ok(entry) => entry,
                Err(TransportError::Status { status: 404, .. }) => {
                    warn!(key = %key, "server has no content for subscribed key");
                    outcome.missing += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.apply(&entry) {
                Ok(true) => outcome.applied += 1,
                Ok(false) => debug!(key = %key, version = entry.version, "content unchanged"),
                Err(e @ ClientError::StaleNotification { .. }) => debug!("{e}"),
                Err(e) => debug!("dropping pulled content: {e}"),
            }
        }

        Ok(outcome)
    }

    /// Run the poll loop until cancelled. Never returns early on failures.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("starting client worker");
        let mut backoff = self.settings.backoff_initial;
        let mut failures: u32 = 0;

        while !cancel.is_cancelled() {
            let probe = self.probe();
            if probe.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.resubscribed.notified() => continue,
                }
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.resubscribed.notified() => continue,
                result = self.agent.long_poll(&probe, self.settings.hold) => result,
            };

            // pulls are not interrupted by cancellation
            let result = match polled {
                Ok(changed) if changed.is_empty() => Ok(PollOutcome::default()),
                Ok(changed) => self.pull_and_apply(changed).await,
                Err(e) => Err(e),
            };

            let pause = match result {
                Ok(outcome) => {
                    failures = 0;
                    backoff = self.settings.backoff_initial;
                    if outcome.applied > 0 {
                        debug!(?outcome, "poll cycle applied changes");
                    }
                    // keys the server keeps reporting but cannot serve
                    (outcome.missing > 0 && outcome.applied == 0)
                        .then_some(self.settings.backoff_initial)
                }
                Err(e) => {
                    failures += 1;
                    let budget = self.settings.retry_budget;
                    if failures < budget {
                        warn!(failures, "poll failed, retrying in {backoff:?}: {e}");
                    } else if failures == budget {
                        error!(failures, "retry budget exhausted, still retrying: {e}");
                    } else {
                        debug!(failures, "poll failed: {e}");
                    }
                    let pause = backoff;
                    backoff = (backoff * 2).min(self.settings.backoff_max);
                    Some(pause)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("client worker stopped");
    }
}
