//! Static access token on the server

use std::sync::Arc;

use assert_matches::assert_matches;
use poolsync::client::{ServerAgent, ServerList};
use poolsync::error::TransportError;
use poolsync::protocol::{CONFIGS_PATH, DEFAULT_TIMEOUT_MARGIN, HEALTH_PATH};

use crate::helpers::*;

fn agent(base_url: String, token: Option<&str>) -> ServerAgent {
    let servers = Arc::new(ServerList::new([base_url]).unwrap());
    ServerAgent::new(servers, TENANT, token.map(str::to_string), DEFAULT_TIMEOUT_MARGIN).unwrap()
}

#[tokio::test]
async fn test_health_is_open() {
    let server = start_server(Some("secret")).await;

    let response = reqwest::get(format!("{}{HEALTH_PATH}", server.base_url()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "UP");
    server.shutdown();
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let server = start_server(Some("secret")).await;

    let response = reqwest::get(format!(
        "{}{CONFIGS_PATH}?tenant=prod&item=orders&pool=a",
        server.base_url()
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "missing access token");
    server.shutdown();
}

#[tokio::test]
async fn test_wrong_token_is_forbidden() {
    let server = start_server(Some("secret")).await;

    let result = agent(server.base_url(), Some("guess"))
        .publish(&key("a"), &pool_config(1, 1, 1))
        .await;
    assert_matches!(result, Err(TransportError::Status { status: 403, .. }));
    server.shutdown();
}

#[tokio::test]
async fn test_client_token_is_accepted() {
    let server = start_server(Some("secret")).await;
    let agent = agent(server.base_url(), Some("secret"));

    agent.publish(&key("a"), &pool_config(1, 1, 1)).await.unwrap();
    assert_eq!(agent.pull(&key("a")).await.unwrap().version, 1);
    server.shutdown();
}

#[tokio::test]
async fn test_rejections_are_json() {
    let server = start_server(Some("secret")).await;
    let client = reqwest::Client::new();
    let url = format!("{}{CONFIGS_PATH}?tenant=prod&item=orders&pool=a", server.base_url());

    let malformed = client
        .get(&url)
        .header("Authorization", "Token secret")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 401);
    let body: serde_json::Value = malformed.json().await.unwrap();
    assert_eq!(body["error"], "expected `Bearer <token>`");

    let wrong = client.get(&url).bearer_auth("guess").send().await.unwrap();
    assert_eq!(wrong.status(), 403);
    let body: serde_json::Value = wrong.json().await.unwrap();
    assert_eq!(body["error"], "access token not accepted");
    server.shutdown();
}
