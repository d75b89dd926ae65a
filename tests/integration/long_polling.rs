//! Long polling over HTTP against a running server

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use poolsync::client::{ServerAgent, ServerList};
use poolsync::digest::fingerprint;
use poolsync::protocol::{DEFAULT_TIMEOUT_MARGIN, Probe};

use crate::helpers::*;

fn agent(base_url: String) -> ServerAgent {
    let servers = Arc::new(ServerList::new([base_url]).unwrap());
    ServerAgent::new(servers, TENANT, None, DEFAULT_TIMEOUT_MARGIN).unwrap()
}

#[tokio::test]
async fn test_mismatch_answers_immediately() {
    let server = start_server(None).await;
    let agent = agent(server.base_url());
    let ack = agent.publish(&key("a"), &pool_config(1, 2, 10)).await.unwrap();

    let probe = Probe::from([(key("a"), "stale".to_string())]);
    let started = Instant::now();
    let changed = agent.long_poll(&probe, Duration::from_secs(5)).await.unwrap();

    assert_eq!(changed, BTreeSet::from([key("a")]));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(ack.version, 1);
    server.shutdown();
}

#[tokio::test]
async fn test_parked_poll_wakes_on_publish() {
    let server = start_server(None).await;
    let agent = agent(server.base_url());
    let initial = pool_config(1, 2, 10);
    let ack = agent.publish(&key("a"), &initial).await.unwrap();
    assert_eq!(ack.fingerprint, fingerprint(&initial.to_content()));

    let probe = Probe::from([(key("a"), ack.fingerprint.clone())]);
    let poller = agent.clone();
    let poll = tokio::spawn(async move { poller.long_poll(&probe, Duration::from_secs(5)).await });

    let coordinator = Arc::clone(&server.state.coordinator);
    assert!(eventually(Duration::from_secs(2), || coordinator.parked_count() == 1).await);

    let started = Instant::now();
    agent.publish(&key("a"), &pool_config(2, 4, 10)).await.unwrap();
    let changed = poll.await.unwrap().unwrap();

    assert_eq!(changed, BTreeSet::from([key("a")]));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(coordinator.parked_count(), 0);
    server.shutdown();
}

#[tokio::test]
async fn test_hold_expiry_answers_empty() {
    let server = start_server(None).await;
    let agent = agent(server.base_url());
    let ack = agent.publish(&key("a"), &pool_config(1, 2, 10)).await.unwrap();

    let probe = Probe::from([(key("a"), ack.fingerprint)]);
    let changed = agent.long_poll(&probe, Duration::from_millis(200)).await.unwrap();

    assert!(changed.is_empty());
    assert_eq!(server.state.coordinator.parked_count(), 0);
    server.shutdown();
}

#[tokio::test]
async fn test_identical_publish_does_not_wake() {
    let server = start_server(None).await;
    let agent = agent(server.base_url());
    let config = pool_config(1, 2, 10);
    let ack = agent.publish(&key("a"), &config).await.unwrap();

    let probe = Probe::from([(key("a"), ack.fingerprint)]);
    let poller = agent.clone();
    let poll =
        tokio::spawn(async move { poller.long_poll(&probe, Duration::from_millis(400)).await });

    let coordinator = Arc::clone(&server.state.coordinator);
    assert!(eventually(Duration::from_secs(2), || coordinator.parked_count() == 1).await);
    let again = agent.publish(&key("a"), &config).await.unwrap();

    assert_eq!(again.version, 1);
    assert!(poll.await.unwrap().unwrap().is_empty());
    server.shutdown();
}

#[tokio::test]
async fn test_unknown_key_counts_as_changed() {
    let server = start_server(None).await;
    let agent = agent(server.base_url());

    let probe = Probe::from([(key("ghost"), String::new())]);
    let changed = agent.long_poll(&probe, Duration::from_secs(5)).await.unwrap();
    assert_eq!(changed, BTreeSet::from([key("ghost")]));
    server.shutdown();
}
