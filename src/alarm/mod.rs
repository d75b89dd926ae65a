//! Alarm controller
//!
//! Samples every registered pool on a fixed period and compares its active
//! thread share and queue fill level against the pool's
//! [`NotifyAlarmConfig`](crate::model::NotifyAlarmConfig).
//!
//! ```text
//! tick ──► sample each pool ──► threshold met? ──► rate limiter ──► notifiers
//!                                     │                               (fan-out)
//!                                     └─ dropped below ──► recovery notice (opt-in)
//! ```

pub mod controller;
pub mod discord;
pub mod limiter;
pub mod notifier;
pub mod webhook;

pub use controller::{AlarmController, AlarmHandle, Evaluator, PendingAlert};
pub use limiter::RateLimiter;
pub use notifier::{DEFAULT_DELIVERY_TIMEOUT, LogNotifier, Notifier, Notifiers};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executor::PoolSample;
use crate::model::GroupKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    Active,
    Capacity,
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Capacity => write!(f, "capacity"),
        }
    }
}

impl ThresholdKind {
    /// Share of the sampled pool this threshold looks at, in percent.
    ///
    /// Capacity is 0 for unbounded queues and queues without storage.
    pub fn percent(self, sample: &PoolSample) -> f64 {
        match self {
            Self::Active => ratio(sample.active_count, sample.max_pool_size),
            Self::Capacity => match sample.queue_capacity {
                Some(capacity) => ratio(sample.queue_size, capacity),
                None => 0.0,
            },
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// What every receiver of a pool is sent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub group_key: GroupKey,
    pub kind: ThresholdKind,
    pub current_percent: f64,
    pub threshold_percent: u32,
    pub recovered: bool,
    pub timestamp: DateTime<Utc>,
}

impl AlertPayload {
    pub fn message(&self) -> String {
        if self.recovered {
            format!(
                "pool {} {} back to {:.1}% (threshold {}%)",
                self.group_key, self.kind, self.current_percent, self.threshold_percent
            )
        } else {
            format!(
                "pool {} {} at {:.1}% (threshold {}%)",
                self.group_key, self.kind, self.current_percent, self.threshold_percent
            )
        }
    }
}
