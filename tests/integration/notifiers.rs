//! Alert delivery through the webhook and Discord channels

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use poolsync::alarm::discord::DiscordNotifier;
use poolsync::alarm::webhook::WebhookNotifier;
use poolsync::alarm::{AlertPayload, Notifier, Notifiers, ThresholdKind};
use poolsync::model::{AlarmReceiver, ChannelKind};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn payload(recovered: bool) -> AlertPayload {
    AlertPayload {
        group_key: key("consume"),
        kind: ThresholdKind::Capacity,
        current_percent: 92.5,
        threshold_percent: 80,
        recovered,
        timestamp: Utc::now(),
    }
}

fn receiver(channel: ChannelKind, server: &MockServer, hook: &str) -> AlarmReceiver {
    AlarmReceiver {
        channel,
        target: format!("{}{hook}", server.uri()),
    }
}

async fn hook(server: &MockServer, at: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_webhook_body() {
    let server = MockServer::start().await;
    hook(&server, "/alerts", 200).await;

    WebhookNotifier::new()
        .send(&receiver(ChannelKind::Webhook, &server, "/alerts"), &payload(false))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["pool"], "consume+orders+prod");
    assert_eq!(body["kind"], "capacity");
    assert_eq!(body["threshold_percent"], 80);
    assert_eq!(body["recovered"], false);
}

#[tokio::test]
async fn test_discord_embed() {
    let server = MockServer::start().await;
    hook(&server, "/discord", 204).await;

    DiscordNotifier::new()
        .send(&receiver(ChannelKind::Discord, &server, "/discord"), &payload(true))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    let embed = &body["embeds"][0];
    assert_eq!(embed["footer"]["text"], "Pool: consume+orders+prod");
    assert_eq!(embed["color"], 0x2ECC71);
    assert!(embed["title"].as_str().unwrap().contains("back to normal"));
}

#[tokio::test]
async fn test_webhook_error_status_is_a_failure() {
    let server = MockServer::start().await;
    hook(&server, "/alerts", 500).await;

    let result = WebhookNotifier::new()
        .send(&receiver(ChannelKind::Webhook, &server, "/alerts"), &payload(false))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_fan_out_survives_one_failing_channel() {
    let server = MockServer::start().await;
    hook(&server, "/broken", 500).await;
    hook(&server, "/discord", 204).await;

    let receivers = BTreeSet::from([
        receiver(ChannelKind::Webhook, &server, "/broken"),
        receiver(ChannelKind::Discord, &server, "/discord"),
        AlarmReceiver {
            channel: ChannelKind::Log,
            target: "ops".to_string(),
        },
    ]);

    let delivered = Notifiers::with_defaults()
        .deliver(&receivers, &payload(false))
        .await;
    assert_eq!(delivered, 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unregistered_channel_is_skipped() {
    let server = MockServer::start().await;
    hook(&server, "/alerts", 200).await;

    let receivers = BTreeSet::from([
        receiver(ChannelKind::Webhook, &server, "/alerts"),
        receiver(ChannelKind::Discord, &server, "/discord"),
    ]);
    let notifiers = Notifiers::new().with(ChannelKind::Webhook, WebhookNotifier::new());

    assert_eq!(notifiers.deliver(&receivers, &payload(false)).await, 1);
}

#[tokio::test]
async fn test_hanging_receiver_is_cut_off() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    hook(&server, "/discord", 204).await;

    let receivers = BTreeSet::from([
        receiver(ChannelKind::Webhook, &server, "/slow"),
        receiver(ChannelKind::Discord, &server, "/discord"),
        AlarmReceiver {
            channel: ChannelKind::Log,
            target: "ops".to_string(),
        },
    ]);
    let notifiers = Notifiers::with_defaults().with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let delivered = notifiers.deliver(&receivers, &payload(false)).await;

    assert_eq!(delivered, 2);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_webhook_client_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let started = Instant::now();
    let result = WebhookNotifier::with_timeout(Duration::from_millis(200))
        .send(&receiver(ChannelKind::Webhook, &server, "/slow"), &payload(false))
        .await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(3));
}
