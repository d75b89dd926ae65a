//! Generic JSON webhook channel

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, instrument};

use crate::error::NotifyError;
use crate::model::AlarmReceiver;

use super::AlertPayload;
use super::notifier::{DEFAULT_DELIVERY_TIMEOUT, Notifier, http_client};

/// Posts the alert as JSON to the receiver's target URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip_all, fields(url = %receiver.target))]
    async fn send(
        &self,
        receiver: &AlarmReceiver,
        payload: &AlertPayload,
    ) -> Result<(), NotifyError> {
        let body = json!({
            "message": payload.message(),
            "pool": payload.group_key.to_string(),
            "kind": payload.kind,
            "current_percent": payload.current_percent,
            "threshold_percent": payload.threshold_percent,
            "recovered": payload.recovered,
            "timestamp": payload.timestamp.to_rfc3339(),
        });

        let response = self
            .client
            .post(&receiver.target)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery {
                target: receiver.target.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(NotifyError::Delivery {
                target: receiver.target.clone(),
                reason: format!("status {}", response.status()),
            });
        }

        info!("sent webhook alert");
        Ok(())
    }
}
