//! Register, publish and apply through a real server and client

use std::time::Duration;

use assert_matches::assert_matches;
use poolsync::alarm::Notifiers;
use poolsync::client::ClientContext;
use poolsync::error::{RegisterError, RegistryError, TransportError, ValidationError};
use poolsync::executor::ExecutorBuilder;
use poolsync::model::NotifyAlarmConfig;

use crate::helpers::*;

fn builder(pool: &str, core: usize, max: usize, capacity: usize) -> ExecutorBuilder {
    ExecutorBuilder::new(pool).parameters(pool_config(core, max, capacity).parameters)
}

#[tokio::test]
async fn test_published_change_reaches_live_pool() {
    let server = start_server(None).await;
    let mut client =
        ClientContext::new(client_settings(vec![server.base_url()]), Notifiers::new()).unwrap();

    let handle = client
        .register_pool(builder("consume", 1, 2, 10), NotifyAlarmConfig::default())
        .await
        .unwrap();
    client.start();

    client
        .agent()
        .publish(&key("consume"), &pool_config(4, 8, 50))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(5), || {
            handle.executor().parameters().max_pool_size == 8
        })
        .await
    );
    let sample = handle.sample();
    assert_eq!(sample.core_pool_size, 4);
    assert_eq!(sample.queue_capacity, Some(50));

    assert!(client.shutdown(Duration::from_secs(2)).await);
    server.shutdown();
}

#[tokio::test]
async fn test_server_copy_wins_on_registration() {
    let server = start_server(None).await;
    let mut client =
        ClientContext::new(client_settings(vec![server.base_url()]), Notifiers::new()).unwrap();

    // an operator configured the pool before the process came up
    client
        .agent()
        .publish(&key("consume"), &pool_config(3, 6, 30))
        .await
        .unwrap();

    let handle = client
        .register_pool(builder("consume", 1, 2, 10), NotifyAlarmConfig::default())
        .await
        .unwrap();
    assert_eq!(handle.executor().parameters().max_pool_size, 2);

    client.start();
    assert!(
        eventually(Duration::from_secs(5), || {
            handle.executor().parameters().max_pool_size == 6
        })
        .await
    );

    client.shutdown(Duration::from_secs(2)).await;
    server.shutdown();
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let server = start_server(None).await;
    let client =
        ClientContext::new(client_settings(vec![server.base_url()]), Notifiers::new()).unwrap();
    let config = pool_config(1, 2, 10);

    let first = client.agent().register(&key("a"), &config).await.unwrap();
    let second = client.agent().register(&key("a"), &config).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.version, second.version);
    assert_eq!(first.fingerprint, second.fingerprint);
    server.shutdown();
}

#[tokio::test]
async fn test_duplicate_local_registration_is_refused() {
    let server = start_server(None).await;
    let client =
        ClientContext::new(client_settings(vec![server.base_url()]), Notifiers::new()).unwrap();

    client
        .register_pool(builder("a", 1, 2, 10), NotifyAlarmConfig::default())
        .await
        .unwrap();
    let again = client
        .register_pool(builder("a", 1, 2, 10), NotifyAlarmConfig::default())
        .await;

    assert_matches!(
        again,
        Err(RegisterError::Registry(RegistryError::DuplicateRegistration(_)))
    );
    assert_eq!(client.registry().len(), 1);
    server.shutdown();
}

#[tokio::test]
async fn test_invalid_registration_touches_nothing() {
    let server = start_server(None).await;
    let client =
        ClientContext::new(client_settings(vec![server.base_url()]), Notifiers::new()).unwrap();

    let result = client
        .register_pool(builder("a", 4, 2, 10), NotifyAlarmConfig::default())
        .await;

    assert_matches!(
        result,
        Err(RegisterError::Validation(ValidationError::CoreExceedsMax { core: 4, max: 2 }))
    );
    assert!(client.registry().is_empty());
    assert_matches!(
        client.agent().pull(&key("a")).await,
        Err(TransportError::Status { status: 404, .. })
    );
    server.shutdown();
}

#[tokio::test]
async fn test_invalid_publish_leaves_pool_unchanged() {
    let server = start_server(None).await;
    let mut client =
        ClientContext::new(client_settings(vec![server.base_url()]), Notifiers::new()).unwrap();
    let handle = client
        .register_pool(builder("a", 1, 2, 10), NotifyAlarmConfig::default())
        .await
        .unwrap();
    client.start();

    let result = client.agent().publish(&key("a"), &pool_config(5, 2, 10)).await;
    assert_matches!(result, Err(TransportError::Status { status: 400, .. }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.executor().parameters().max_pool_size, 2);
    assert_eq!(client.agent().pull(&key("a")).await.unwrap().version, 1);

    client.shutdown(Duration::from_secs(2)).await;
    server.shutdown();
}

#[tokio::test]
async fn test_runtime_reports_reach_server() {
    let server = start_server(None).await;
    let mut settings = client_settings(vec![server.base_url()]);
    settings.report_period = Some(Duration::from_millis(50));
    let mut client = ClientContext::new(settings, Notifiers::new()).unwrap();

    client
        .register_pool(builder("a", 2, 4, 10), NotifyAlarmConfig::default())
        .await
        .unwrap();
    client.start();

    let state = server.state.clone();
    assert!(eventually(Duration::from_secs(5), || !state.reports().is_empty()).await);
    let report = &state.reports()[0];
    assert_eq!(report.group_key, key("a"));
    assert_eq!(report.sample.max_pool_size, 4);

    client.shutdown(Duration::from_secs(2)).await;
    server.shutdown();
}
