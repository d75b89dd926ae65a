//! Data model shared by server and client

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Separator between group-key components in their textual form
pub const GROUP_KEY_SEPARATOR: char = '+';

/// Characters that may never appear in a group-key component
const RESERVED: [char; 3] = [
    GROUP_KEY_SEPARATOR,
    crate::protocol::WORD_SEPARATOR,
    crate::protocol::LINE_SEPARATOR,
];

/// Fleet-wide identity of one pool subscription: `(tenant, item, pool id)`.
///
/// The textual form is `pool+item+tenant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "GroupKeyParts")]
pub struct GroupKey {
    tenant: String,
    item: String,
    pool_id: String,
}

impl GroupKey {
    pub fn new(
        tenant: impl Into<String>,
        item: impl Into<String>,
        pool_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let key = Self {
            tenant: tenant.into(),
            item: item.into(),
            pool_id: pool_id.into(),
        };
        check_component("tenant", &key.tenant)?;
        check_component("item", &key.item)?;
        check_component("pool_id", &key.pool_id)?;
        Ok(key)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }
}

/// Unvalidated wire form of a [`GroupKey`]
#[derive(Deserialize)]
struct GroupKeyParts {
    tenant: String,
    item: String,
    pool_id: String,
}

impl TryFrom<GroupKeyParts> for GroupKey {
    type Error = ValidationError;

    fn try_from(parts: GroupKeyParts) -> Result<Self, Self::Error> {
        GroupKey::new(parts.tenant, parts.item, parts.pool_id)
    }
}

fn check_component(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if let Some(found) = value.chars().find(|c| RESERVED.contains(c)) {
        return Err(ValidationError::ReservedCharacter { field, found });
    }
    Ok(())
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{GROUP_KEY_SEPARATOR}{}{GROUP_KEY_SEPARATOR}{}",
            self.pool_id, self.item, self.tenant
        )
    }
}

impl FromStr for GroupKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(GROUP_KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(pool_id), Some(item), Some(tenant), None) => {
                GroupKey::new(tenant, item, pool_id)
            }
            _ => Err(ValidationError::Content(format!("malformed group key {s:?}"))),
        }
    }
}

/// One stored configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub group_key: GroupKey,
    pub content: String,
    pub fingerprint: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Work queue implementations a pool can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Bounded FIFO with a fixed capacity
    Array,
    /// FIFO, bounded by the capacity; a capacity of 0 means unbounded
    #[default]
    Linked,
    /// Like `Linked`, but its capacity can change without a new queue
    ResizableLinked,
    /// Direct hand-off to an idle worker, never stores tasks
    Synchronous,
}

impl QueueKind {
    /// Effective bound for a configured capacity, `None` meaning unbounded.
    pub fn bound(self, capacity: usize) -> Option<usize> {
        match self {
            QueueKind::Array => Some(capacity),
            QueueKind::Linked | QueueKind::ResizableLinked if capacity == 0 => None,
            QueueKind::Linked | QueueKind::ResizableLinked => Some(capacity),
            QueueKind::Synchronous => Some(0),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueKind::Array => "array",
            QueueKind::Linked => "linked",
            QueueKind::ResizableLinked => "resizable_linked",
            QueueKind::Synchronous => "synchronous",
        };
        f.write_str(name)
    }
}

/// What happens to a task when the queue is full and all workers are busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicyKind {
    /// Refuse with `ExecutorError::Rejected`
    #[default]
    Abort,
    /// Drop the task silently
    Discard,
    /// Evict the queue head, then enqueue
    DiscardOldest,
    /// Run the task on the submitting thread
    CallerRuns,
}

fn default_core_pool_size() -> usize {
    1
}

fn default_max_pool_size() -> usize {
    1
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1024
}

/// Tunable parameters of a dynamic executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorParameters {
    #[serde(default = "default_core_pool_size")]
    pub core_pool_size: usize,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub allow_core_thread_timeout: bool,
    #[serde(default)]
    pub queue_kind: QueueKind,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub rejection_policy: RejectionPolicyKind,
    /// 0 disables the execution-timeout warning
    #[serde(default)]
    pub execution_timeout_ms: u64,
}

impl Default for ExecutorParameters {
    fn default() -> Self {
        Self {
            core_pool_size: default_core_pool_size(),
            max_pool_size: default_max_pool_size(),
            keep_alive_secs: default_keep_alive_secs(),
            allow_core_thread_timeout: false,
            queue_kind: QueueKind::default(),
            queue_capacity: default_queue_capacity(),
            rejection_policy: RejectionPolicyKind::default(),
            execution_timeout_ms: 0,
        }
    }
}

impl ExecutorParameters {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.core_pool_size == 0 {
            return Err(ValidationError::ZeroCorePoolSize);
        }
        if self.max_pool_size == 0 {
            return Err(ValidationError::ZeroMaxPoolSize);
        }
        if self.core_pool_size > self.max_pool_size {
            return Err(ValidationError::CoreExceedsMax {
                core: self.core_pool_size,
                max: self.max_pool_size,
            });
        }
        if self.allow_core_thread_timeout && self.keep_alive_secs == 0 {
            return Err(ValidationError::CoreTimeoutWithoutKeepAlive);
        }
        Ok(())
    }

    /// Effective queue bound, `None` meaning unbounded.
    pub fn queue_bound(&self) -> Option<usize> {
        self.queue_kind.bound(self.queue_capacity)
    }

    /// Whether moving from `self` to `next` needs a new underlying queue.
    pub fn requires_new_queue(&self, next: &ExecutorParameters) -> bool {
        if self.queue_kind != next.queue_kind {
            return true;
        }
        self.queue_bound() != next.queue_bound() && self.queue_kind != QueueKind::ResizableLinked
    }
}

/// Outbound channel an alert can be delivered through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Log,
    Webhook,
    Discord,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Log => "log",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Discord => "discord",
        };
        f.write_str(name)
    }
}

/// One alert destination: a channel plus its target (URL, mention, label)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmReceiver {
    pub channel: ChannelKind,
    pub target: String,
}

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> u32 {
    80
}

fn default_interval_secs() -> u64 {
    5
}

/// Per-pool alarm settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyAlarmConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub active_threshold_percent: u32,
    #[serde(default = "default_threshold")]
    pub capacity_threshold_percent: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub receivers: BTreeSet<AlarmReceiver>,
    #[serde(default)]
    pub notify_on_recovery: bool,
}

impl Default for NotifyAlarmConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            active_threshold_percent: default_threshold(),
            capacity_threshold_percent: default_threshold(),
            interval_secs: default_interval_secs(),
            receivers: BTreeSet::new(),
            notify_on_recovery: false,
        }
    }
}

impl NotifyAlarmConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("active_threshold_percent", self.active_threshold_percent),
            ("capacity_threshold_percent", self.capacity_threshold_percent),
        ] {
            if value > 100 {
                return Err(ValidationError::ThresholdOutOfRange { field, value });
            }
        }
        Ok(())
    }
}

/// The document stored under a group key: executor parameters plus alarm settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(flatten)]
    pub parameters: ExecutorParameters,
    #[serde(default)]
    pub alarm: NotifyAlarmConfig,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.parameters.validate()?;
        self.alarm.validate()
    }

    pub fn to_content(&self) -> String {
        // serializing plain structs with string keys cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_content(content: &str) -> Result<Self, ValidationError> {
        let config: PoolConfig = serde_json::from_str(content)
            .map_err(|e| ValidationError::Content(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
