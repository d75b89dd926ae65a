//! Per `(pool, threshold)` alert rate limiting
//!
//! The window starts when an alert is sent, not when a breach is evaluated,
//! so a threshold that stays breached alerts at most once per interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::model::GroupKey;

use super::ThresholdKind;

#[derive(Debug, Default)]
pub struct RateLimiter {
    last_sent: HashMap<(GroupKey, ThresholdKind), Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the last send for `(key, kind)` is at least `interval` old.
    pub fn is_open(
        &self,
        key: &GroupKey,
        kind: ThresholdKind,
        interval: Duration,
        now: Instant,
    ) -> bool {
        match self.last_sent.get(&(key.clone(), kind)) {
            Some(last) => now.saturating_duration_since(*last) >= interval,
            None => true,
        }
    }

    /// Start a new window at `now`.
    pub fn record(&mut self, key: &GroupKey, kind: ThresholdKind, now: Instant) {
        self.last_sent.insert((key.clone(), kind), now);
    }

    /// Forget pools that are no longer registered.
    pub fn retain(&mut self, mut keep: impl FnMut(&GroupKey) -> bool) {
        self.last_sent.retain(|(key, _), _| keep(key));
    }
}
