//! Discord webhook channel

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::error::NotifyError;
use crate::model::AlarmReceiver;

use super::notifier::{DEFAULT_DELIVERY_TIMEOUT, Notifier, http_client};
use super::{AlertPayload, ThresholdKind};

const COLOR_BREACH: u32 = 0xE74C3C;
const COLOR_RECOVERED: u32 = 0x2ECC71;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

/// Posts an embed to the Discord webhook URL in the receiver's target.
#[derive(Debug, Clone)]
pub struct DiscordNotifier {
    client: Client,
}

impl Default for DiscordNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscordNotifier {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }

    pub fn build_embed(payload: &AlertPayload) -> Embed {
        let subject = match payload.kind {
            ThresholdKind::Active => "Active threads",
            ThresholdKind::Capacity => "Queue capacity",
        };
        let (title, color) = if payload.recovered {
            (format!("✅ {subject} back to normal"), COLOR_RECOVERED)
        } else {
            (format!("🚨 {subject} threshold reached"), COLOR_BREACH)
        };

        Embed {
            title: Some(title),
            description: Some(payload.message()),
            color: Some(color),
            fields: vec![
                EmbedField {
                    name: "Current".to_string(),
                    value: progress_bar(payload.current_percent),
                    inline: false,
                },
                EmbedField {
                    name: "Threshold".to_string(),
                    value: format!("{}%", payload.threshold_percent),
                    inline: true,
                },
            ],
            footer: Some(EmbedFooter {
                text: format!("Pool: {}", payload.group_key),
            }),
            timestamp: Some(payload.timestamp.to_rfc3339()),
        }
    }
}

fn progress_bar(percent: f64) -> String {
    let filled = ((percent / 10.0) as usize).min(10);
    let bar = "█".repeat(filled) + &"░".repeat(10 - filled);
    format!("`{bar}` {percent:.1}%")
}

#[async_trait]
impl Notifier for DiscordNotifier {
    #[instrument(skip_all)]
    async fn send(
        &self,
        receiver: &AlarmReceiver,
        payload: &AlertPayload,
    ) -> Result<(), NotifyError> {
        let message = MessageBuilder::new()
            .add_embed(Self::build_embed(payload))
            .build();

        let response = self
            .client
            .post(&receiver.target)
            .json(&message)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery {
                target: receiver.target.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            if let Ok(error_text) = response.text().await {
                error!("Discord API error response: {error_text}");
            }
            return Err(NotifyError::Delivery {
                target: receiver.target.clone(),
                reason: format!("status {status}"),
            });
        }

        info!("sent Discord alert");
        Ok(())
    }
}
