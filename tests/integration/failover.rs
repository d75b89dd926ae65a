//! Server-list failover against a dead and a live server

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use poolsync::alarm::Notifiers;
use poolsync::client::{ClientContext, ServerAgent, ServerList};
use poolsync::error::{RegisterError, TransportError};
use poolsync::executor::ExecutorBuilder;
use poolsync::model::NotifyAlarmConfig;
use poolsync::protocol::DEFAULT_TIMEOUT_MARGIN;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Answers 503 to everything, health included
async fn dead_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_server_error_fails_over_before_retry() {
    let dead = dead_server().await;
    let live = start_server(None).await;
    let servers = Arc::new(ServerList::new([dead.uri(), live.base_url()]).unwrap());
    let agent = ServerAgent::new(Arc::clone(&servers), TENANT, None, DEFAULT_TIMEOUT_MARGIN).unwrap();

    let first = agent.publish(&key("a"), &pool_config(1, 2, 10)).await;
    assert_matches!(first, Err(TransportError::Status { status: 503, .. }));
    assert_eq!(servers.current_server_addr(), live.base_url());
    assert!(!servers.is_healthy(&dead.uri()));

    let retry = agent.publish(&key("a"), &pool_config(1, 2, 10)).await.unwrap();
    assert_eq!(retry.version, 1);
    live.shutdown();
}

#[tokio::test]
async fn test_unreachable_server_fails_over() {
    // nothing listens on the first address
    let live = start_server(None).await;
    let servers =
        Arc::new(ServerList::new(["127.0.0.1:1".to_string(), live.base_url()]).unwrap());
    let agent = ServerAgent::new(Arc::clone(&servers), TENANT, None, DEFAULT_TIMEOUT_MARGIN).unwrap();

    assert_matches!(
        agent.pull(&key("a")).await,
        Err(TransportError::Request { .. })
    );
    assert_eq!(servers.current_server_addr(), live.base_url());
    live.shutdown();
}

#[tokio::test]
async fn test_client_keeps_working_after_failover() {
    let dead = dead_server().await;
    let live = start_server(None).await;
    let mut client = ClientContext::new(
        client_settings(vec![dead.uri(), live.base_url()]),
        Notifiers::new(),
    )
    .unwrap();
    let builder = || ExecutorBuilder::new("a").parameters(pool_config(1, 2, 10).parameters);

    let refused = client
        .register_pool(builder(), NotifyAlarmConfig::default())
        .await;
    assert_matches!(refused, Err(RegisterError::Transport(_)));
    assert!(client.registry().is_empty());

    let handle = client
        .register_pool(builder(), NotifyAlarmConfig::default())
        .await
        .unwrap();
    client.start();

    client
        .agent()
        .publish(&key("a"), &pool_config(2, 3, 10))
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            handle.executor().parameters().max_pool_size == 3
        })
        .await
    );

    client.shutdown(Duration::from_secs(2)).await;
    live.shutdown();
}
