//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use poolsync::client::{ClientSettings, WorkerSettings};
use poolsync::model::{ExecutorParameters, GroupKey, NotifyAlarmConfig, PoolConfig, QueueKind};
use poolsync::server::{ServerHandle, ServerSettings, spawn_server};
use poolsync::storage::{ConfigStore, MemoryConfigStore};

pub const TENANT: &str = "prod";
pub const ITEM: &str = "orders";

pub fn key(pool: &str) -> GroupKey {
    GroupKey::new(TENANT, ITEM, pool).unwrap()
}

/// Server on an ephemeral port with an in-memory store
pub async fn start_server(token: Option<&str>) -> ServerHandle {
    start_server_with(Arc::new(MemoryConfigStore::new()), token).await
}

pub async fn start_server_with(
    store: Arc<dyn ConfigStore>,
    token: Option<&str>,
) -> ServerHandle {
    let settings = ServerSettings {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        auth_token: token.map(str::to_string),
        max_hold: Duration::from_secs(10),
    };
    spawn_server(settings, store).await.unwrap()
}

/// Client settings with short holds and fast retries
pub fn client_settings(servers: Vec<String>) -> ClientSettings {
    let mut settings = ClientSettings::new(servers, TENANT, ITEM);
    settings.worker = WorkerSettings {
        hold: Duration::from_millis(500),
        timeout_margin: Duration::from_millis(500),
        backoff_initial: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
        retry_budget: 3,
    };
    settings.health_refresh = Duration::from_secs(60);
    settings.alarm_check = Duration::from_secs(60);
    settings
}

pub fn pool_config(core: usize, max: usize, capacity: usize) -> PoolConfig {
    PoolConfig {
        parameters: ExecutorParameters {
            core_pool_size: core,
            max_pool_size: max,
            queue_kind: QueueKind::ResizableLinked,
            queue_capacity: capacity,
            ..Default::default()
        },
        alarm: NotifyAlarmConfig::default(),
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
