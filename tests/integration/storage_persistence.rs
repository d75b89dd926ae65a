//! Config server backed by SQLite across restarts

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use poolsync::client::{ServerAgent, ServerList};
use poolsync::protocol::{DEFAULT_TIMEOUT_MARGIN, Probe};
use poolsync::storage::ConfigStore;
use poolsync::storage::sqlite::SqliteConfigStore;
use tempfile::TempDir;

use crate::helpers::*;

fn agent(base_url: String) -> ServerAgent {
    let servers = Arc::new(ServerList::new([base_url]).unwrap());
    ServerAgent::new(servers, TENANT, None, DEFAULT_TIMEOUT_MARGIN).unwrap()
}

#[tokio::test]
async fn test_versions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("poolsync.db");

    let store = Arc::new(SqliteConfigStore::new(&db).await.unwrap());
    let server = start_server_with(store.clone(), None).await;
    let first = agent(server.base_url());
    first.publish(&key("a"), &pool_config(1, 2, 10)).await.unwrap();
    first.publish(&key("a"), &pool_config(2, 4, 10)).await.unwrap();
    server.shutdown();
    store.close().await.unwrap();

    let store = Arc::new(SqliteConfigStore::new(&db).await.unwrap());
    let server = start_server_with(store, None).await;
    let second = agent(server.base_url());

    let entry = second.pull(&key("a")).await.unwrap();
    assert_eq!(entry.version, 2);
    let ack = second.publish(&key("a"), &pool_config(3, 6, 10)).await.unwrap();
    assert_eq!(ack.version, 3);
    server.shutdown();
}

#[tokio::test]
async fn test_sqlite_write_wakes_parked_poll() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteConfigStore::new(dir.path().join("poolsync.db")).await.unwrap());
    let server = start_server_with(store, None).await;
    let agent = agent(server.base_url());
    let ack = agent.publish(&key("a"), &pool_config(1, 2, 10)).await.unwrap();

    let probe = Probe::from([(key("a"), ack.fingerprint)]);
    let poller = agent.clone();
    let poll = tokio::spawn(async move { poller.long_poll(&probe, Duration::from_secs(5)).await });

    let coordinator = Arc::clone(&server.state.coordinator);
    assert!(eventually(Duration::from_secs(2), || coordinator.parked_count() == 1).await);
    agent.publish(&key("a"), &pool_config(2, 2, 10)).await.unwrap();

    assert_eq!(poll.await.unwrap().unwrap(), BTreeSet::from([key("a")]));
    server.shutdown();
}
