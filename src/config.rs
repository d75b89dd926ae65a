use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::trace;

use crate::client::{ClientSettings, WorkerSettings};
use crate::model::{AlarmReceiver, ExecutorParameters, GroupKey, NotifyAlarmConfig, PoolConfig};
use crate::server::ServerSettings;
use crate::util;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./poolsync.db")
}

fn default_hold_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    #[serde(default = "util::get_default_addr")]
    pub address: IpAddr,
    #[serde(default = "util::get_default_port")]
    pub port: u16,
    #[serde(default = "default_hold_ms")]
    pub long_poll_hold_ms: u64,
    pub token: Option<String>,

    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,
}

impl ServerConfig {
    /// Apply `POOLSYNC_ADDR`, `POOLSYNC_PORT` and `POOLSYNC_TOKEN`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(address) = util::get_addr() {
            self.address = address;
        }
        if let Some(port) = util::get_port() {
            self.port = port;
        }
        if let Some(token) = util::get_token() {
            self.token = Some(token);
        }
        self
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            bind_addr: SocketAddr::new(self.address, self.port),
            auth_token: self.token.clone(),
            max_hold: Duration::from_millis(self.long_poll_hold_ms),
        }
    }
}

fn default_timeout_margin_ms() -> u64 {
    3_000
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_retry_budget() -> u32 {
    10
}

fn default_health_refresh_secs() -> u64 {
    30
}

fn default_alarm_check_secs() -> u64 {
    5
}

/// A pool the client registers on startup
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolEntry {
    pub pool_id: String,
    #[serde(flatten)]
    pub parameters: ExecutorParameters,

    /// Falls back to the client's `alarm` section
    pub alarm: Option<NotifyAlarmConfig>,

    /// Names from the client's `channels` section
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClientConfig {
    pub servers: Vec<String>,
    pub tenant: String,
    pub item: String,
    pub token: Option<String>,
    #[serde(default = "default_hold_ms")]
    pub long_poll_hold_ms: u64,
    #[serde(default = "default_timeout_margin_ms")]
    pub timeout_margin_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_health_refresh_secs")]
    pub health_refresh_secs: u64,
    #[serde(default = "default_alarm_check_secs")]
    pub alarm_check_secs: u64,

    /// 0 disables runtime reports
    #[serde(default)]
    pub report_secs: u64,

    #[serde(default)]
    pub alarm: NotifyAlarmConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, AlarmReceiver>,
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
}

impl ClientConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(token) = util::get_token() {
            self.token = Some(token);
        }
        self
    }

    pub fn settings(&self) -> ClientSettings {
        let timeout_margin = Duration::from_millis(self.timeout_margin_ms);
        ClientSettings {
            servers: self.servers.clone(),
            tenant: self.tenant.clone(),
            item: self.item.clone(),
            token: self.token.clone(),
            worker: WorkerSettings {
                hold: Duration::from_millis(self.long_poll_hold_ms),
                timeout_margin,
                backoff_initial: Duration::from_millis(self.backoff_initial_ms),
                backoff_max: Duration::from_millis(self.backoff_max_ms),
                retry_budget: self.retry_budget,
            },
            health_refresh: Duration::from_secs(self.health_refresh_secs),
            alarm_check: Duration::from_secs(self.alarm_check_secs),
            report_period: (self.report_secs > 0).then(|| Duration::from_secs(self.report_secs)),
        }
    }

    /// Group key and full configuration of every declared pool.
    pub fn resolve_pools(&self) -> anyhow::Result<Vec<(GroupKey, PoolConfig)>> {
        self.pools
            .iter()
            .map(|pool| -> anyhow::Result<(GroupKey, PoolConfig)> {
                let key = GroupKey::new(&self.tenant, &self.item, &pool.pool_id)
                    .with_context(|| format!("invalid pool id {:?}", pool.pool_id))?;

                let mut alarm = pool.alarm.clone().unwrap_or_else(|| self.alarm.clone());
                for name in &pool.channels {
                    let Some(receiver) = self.channels.get(name) else {
                        bail!("pool {} references unknown channel {name:?}", pool.pool_id);
                    };
                    alarm.receivers.insert(receiver.clone());
                }

                let config = PoolConfig {
                    parameters: pool.parameters.clone(),
                    alarm,
                };
                config
                    .validate()
                    .with_context(|| format!("invalid configuration for pool {}", pool.pool_id))?;
                Ok((key, config))
            })
            .collect()
    }
}

pub fn read_config_file<T>(path: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned + std::fmt::Debug,
{
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
