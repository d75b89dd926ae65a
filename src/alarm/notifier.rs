//! Alert delivery channels
//!
//! Every receiver of a pool gets the same payload. Channels are independent:
//! one failing or slow channel neither blocks nor fails the others.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::model::{AlarmReceiver, ChannelKind};

use super::AlertPayload;
use super::discord::DiscordNotifier;
use super::webhook::WebhookNotifier;

/// Upper bound on a single delivery, including connect and response.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the outbound channels.
pub(crate) fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!("failed to build notifier client, using defaults: {e}");
            Client::new()
        })
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, receiver: &AlarmReceiver, payload: &AlertPayload)
    -> Result<(), NotifyError>;
}

/// Writes alerts to the tracing log; the receiver target is used as a label.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        receiver: &AlarmReceiver,
        payload: &AlertPayload,
    ) -> Result<(), NotifyError> {
        warn!(
            target: "poolsync::alarm",
            receiver = %receiver.target,
            pool = %payload.group_key,
            kind = %payload.kind,
            current = payload.current_percent,
            threshold = payload.threshold_percent,
            recovered = payload.recovered,
            "{}",
            payload.message()
        );
        Ok(())
    }
}

/// Notifier per channel kind
#[derive(Clone)]
pub struct Notifiers {
    channels: HashMap<ChannelKind, Arc<dyn Notifier>>,
    timeout: Duration,
}

impl Default for Notifiers {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log, webhook and Discord channels
    pub fn with_defaults() -> Self {
        Self::new()
            .with(ChannelKind::Log, LogNotifier)
            .with(ChannelKind::Webhook, WebhookNotifier::new())
            .with(ChannelKind::Discord, DiscordNotifier::new())
    }

    pub fn with(mut self, kind: ChannelKind, notifier: impl Notifier + 'static) -> Self {
        self.channels.insert(kind, Arc::new(notifier));
        self
    }

    /// Give up on a receiver that has not answered within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn insert(&mut self, kind: ChannelKind, notifier: Arc<dyn Notifier>) {
        self.channels.insert(kind, notifier);
    }

    /// Send `payload` to every receiver concurrently; returns the number of
    /// successful deliveries. Failures are logged.
    pub async fn deliver(
        &self,
        receivers: &BTreeSet<AlarmReceiver>,
        payload: &AlertPayload,
    ) -> usize {
        let sends = receivers.iter().map(|receiver| async move {
            let result = match self.channels.get(&receiver.channel) {
                Some(notifier) => {
                    let send = notifier.send(receiver, payload);
                    tokio::time::timeout(self.timeout, send)
                        .await
                        .unwrap_or_else(|_| {
                            Err(NotifyError::Delivery {
                                target: receiver.target.clone(),
                                reason: format!("no answer within {:?}", self.timeout),
                            })
                        })
                }
                None => Err(NotifyError::UnknownChannel(receiver.channel.to_string())),
            };
            (receiver, result)
        });

        let mut delivered = 0;
        for (receiver, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    delivered += 1;
                    debug!(channel = %receiver.channel, pool = %payload.group_key, "alert delivered");
                }
                Err(e) => warn!(
                    channel = %receiver.channel,
                    pool = %payload.group_key,
                    "alert delivery failed: {e}"
                ),
            }
        }
        delivered
    }
}
