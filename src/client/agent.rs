//! HTTP calls from a client process to the config server

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{instrument, trace};

use crate::error::TransportError;
use crate::model::{ConfigEntry, GroupKey, PoolConfig};
use crate::protocol::{
    self, CONFIGS_PATH, ConfigQuery, LISTENER_PATH, LONG_PULLING_TIMEOUT_HEADER, ListenerRequest,
    MONITOR_PATH, Probe, PublishRequest, REGISTER_PATH, RegisterRequest, RegisterResponse,
    RuntimeReport, TENANT_HEADER, WriteAck,
};

use super::server_list::ServerList;

/// Timeout of every call except the long poll
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to whichever server the [`ServerList`] currently selects.
#[derive(Clone)]
pub struct ServerAgent {
    servers: Arc<ServerList>,
    http: reqwest::Client,
    token: Option<String>,
    tenant: String,
    timeout_margin: Duration,
}

impl ServerAgent {
    pub fn new(
        servers: Arc<ServerList>,
        tenant: impl Into<String>,
        token: Option<String>,
        timeout_margin: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| TransportError::Request {
                url: servers.current_server_addr().to_string(),
                source,
            })?;

        Ok(Self {
            servers,
            http,
            token,
            tenant: tenant.into(),
            timeout_margin,
        })
    }

    pub fn servers(&self) -> &Arc<ServerList> {
        &self.servers
    }

    /// Send a request to the current server; transport failures trigger a
    /// server-list refresh before they are returned.
    async fn send<F>(
        &self,
        path: &str,
        timeout: Duration,
        build: F,
    ) -> Result<reqwest::Response, TransportError>
    where
        F: FnOnce(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let address = self.servers.current_server_addr().to_string();
        let url = format!("{address}{path}");

        let mut request = build(&self.http, &url).timeout(timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => {
                self.servers.report_failure(&address).await;
                return Err(if source.is_timeout() {
                    TransportError::Timeout { url, timeout }
                } else {
                    TransportError::Request { url, source }
                });
            }
        };

        let status = response.status();
        if status.is_server_error() {
            self.servers.report_failure(&address).await;
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|e| TransportError::Malformed {
                url,
                reason: e.to_string(),
            })
    }

    /// Long-poll for changed keys; the client timeout exceeds the hold by the
    /// configured margin so an empty answer can be told apart from a failure.
    #[instrument(skip(self, probe), fields(keys = probe.len()))]
    pub async fn long_poll(
        &self,
        probe: &Probe,
        hold: Duration,
    ) -> Result<BTreeSet<GroupKey>, TransportError> {
        let body = ListenerRequest {
            probe: protocol::encode_probe(probe),
        };
        let response = self
            .send(LISTENER_PATH, hold + self.timeout_margin, |http, url| {
                http.post(url)
                    .header(LONG_PULLING_TIMEOUT_HEADER, hold.as_millis().to_string())
                    .header(TENANT_HEADER, &self.tenant)
                    .json(&body)
            })
            .await?;

        let url = response.url().to_string();
        let text = response
            .text()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;
        let changed = protocol::decode_keys(&text).map_err(|e| TransportError::Malformed {
            url,
            reason: e.to_string(),
        })?;
        trace!(changed = changed.len(), "long poll answered");
        Ok(changed)
    }

    /// Fetch the full entry of one key.
    pub async fn pull(&self, key: &GroupKey) -> Result<ConfigEntry, TransportError> {
        let query = ConfigQuery::for_key(key);
        let response = self
            .send(CONFIGS_PATH, REQUEST_TIMEOUT, |http, url| {
                http.get(url).query(&query)
            })
            .await?;
        Self::json(response).await
    }

    #[instrument(skip(self, config), fields(key = %key))]
    pub async fn register(
        &self,
        key: &GroupKey,
        config: &PoolConfig,
    ) -> Result<RegisterResponse, TransportError> {
        let body = RegisterRequest {
            group_key: key.clone(),
            config: config.clone(),
        };
        let response = self
            .send(REGISTER_PATH, REQUEST_TIMEOUT, |http, url| {
                http.post(url).json(&body)
            })
            .await?;
        Self::json(response).await
    }

    /// Operator write of new content
    pub async fn publish(
        &self,
        key: &GroupKey,
        config: &PoolConfig,
    ) -> Result<WriteAck, TransportError> {
        let body = PublishRequest {
            group_key: key.clone(),
            config: config.clone(),
        };
        let response = self
            .send(CONFIGS_PATH, REQUEST_TIMEOUT, |http, url| {
                http.post(url).json(&body)
            })
            .await?;
        Self::json(response).await
    }

    pub async fn report(&self, report: &RuntimeReport) -> Result<(), TransportError> {
        self.send(MONITOR_PATH, REQUEST_TIMEOUT, |http, url| {
            http.post(url).json(report)
        })
        .await?;
        Ok(())
    }
}
