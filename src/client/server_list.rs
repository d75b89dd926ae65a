//! Server-list / failover manager
//!
//! Every outbound call reads [`ServerList::current_server_addr`]. A call that
//! fails at the transport level reports the address, which marks it
//! unhealthy and triggers an immediate refresh before the caller retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::TransportError;
use crate::protocol::HEALTH_PATH;

/// Timeout of a single health probe
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

const HEALTHY_BODY: &str = "UP";

#[derive(Debug)]
pub struct ServerList {
    addresses: Vec<String>,
    current: AtomicUsize,
    healthy: Vec<AtomicBool>,
    http: reqwest::Client,
    refresh_lock: tokio::sync::Mutex<()>,
}

fn normalize(address: String) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

impl ServerList {
    pub fn new<I, S>(addresses: I) -> Result<Self, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses: Vec<String> = addresses
            .into_iter()
            .map(|address| normalize(address.into()))
            .collect();
        let Some(first) = addresses.first() else {
            return Err(TransportError::NoServer);
        };

        let http = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|source| TransportError::Request {
                url: first.clone(),
                source,
            })?;

        Ok(Self {
            healthy: addresses.iter().map(|_| AtomicBool::new(true)).collect(),
            addresses,
            current: AtomicUsize::new(0),
            http,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Base URL every call should currently target
    pub fn current_server_addr(&self) -> &str {
        &self.addresses[self.current.load(Ordering::SeqCst) % self.addresses.len()]
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn is_healthy(&self, address: &str) -> bool {
        self.index_of(address)
            .is_some_and(|index| self.healthy[index].load(Ordering::SeqCst))
    }

    fn index_of(&self, address: &str) -> Option<usize> {
        self.addresses.iter().position(|a| a == address)
    }

    /// A call against `address` failed at the transport level.
    pub async fn report_failure(&self, address: &str) {
        if let Some(index) = self.index_of(address) {
            self.healthy[index].store(false, Ordering::SeqCst);
        }
        debug!(address, "transport failure reported, refreshing");
        self.refresh().await;
    }

    /// Re-check the current address and move to the next healthy one if it
    /// does not answer. Returns the address selected afterwards.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> String {
        let _guard = self.refresh_lock.lock().await;

        let count = self.addresses.len();
        let start = self.current.load(Ordering::SeqCst) % count;
        if self.probe(start).await {
            return self.addresses[start].clone();
        }

        for offset in 1..count {
            let candidate = (start + offset) % count;
            if self.probe(candidate).await {
                self.current.store(candidate, Ordering::SeqCst);
                info!(
                    from = %self.addresses[start],
                    to = %self.addresses[candidate],
                    "failed over to next server"
                );
                return self.addresses[candidate].clone();
            }
        }

        // nobody answered; keep rotating so retries spread over the list
        let next = (start + 1) % count;
        self.current.store(next, Ordering::SeqCst);
        warn!(next = %self.addresses[next], "no healthy server found");
        self.addresses[next].clone()
    }

    async fn probe(&self, index: usize) -> bool {
        let url = format!("{}{HEALTH_PATH}", self.addresses[index]);
        let healthy = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => response
                .text()
                .await
                .is_ok_and(|body| body.trim() == HEALTHY_BODY),
            Ok(response) => {
                trace!(url, status = %response.status(), "health probe failed");
                false
            }
            Err(e) => {
                trace!(url, "health probe failed: {e}");
                false
            }
        };
        self.healthy[index].store(healthy, Ordering::SeqCst);
        healthy
    }

    /// Periodic health refresh until cancelled
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        debug!("starting server list refresh");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; the list starts out optimistic
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
        debug!("server list refresh stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn healthy_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(HEALTH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("UP"))
            .mount(&server)
            .await;
        server
    }

    async fn failing_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(HEALTH_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_empty_list_is_rejected() {
        assert_matches!(ServerList::new(Vec::<String>::new()), Err(TransportError::NoServer));
    }

    #[test]
    fn test_addresses_are_normalized() {
        let list = ServerList::new(["127.0.0.1:8080/", "https://config.example"]).unwrap();
        assert_eq!(
            list.addresses(),
            ["http://127.0.0.1:8080", "https://config.example"]
        );
        assert_eq!(list.current_server_addr(), "http://127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_refresh_keeps_healthy_current() {
        let first = healthy_server().await;
        let second = healthy_server().await;
        let list = ServerList::new([first.uri(), second.uri()]).unwrap();

        assert_eq!(list.refresh().await, first.uri());
        assert!(list.is_healthy(&first.uri()));
    }

    #[tokio::test]
    async fn test_refresh_rotates_to_next_healthy() {
        let dead = failing_server().await;
        let also_dead = failing_server().await;
        let alive = healthy_server().await;
        let list = ServerList::new([dead.uri(), also_dead.uri(), alive.uri()]).unwrap();

        list.report_failure(&dead.uri()).await;

        assert_eq!(list.current_server_addr(), alive.uri());
        assert!(!list.is_healthy(&dead.uri()));
        assert!(!list.is_healthy(&also_dead.uri()));
    }

    #[tokio::test]
    async fn test_refresh_without_healthy_server_rotates() {
        let dead = failing_server().await;
        let also_dead = failing_server().await;
        let list = ServerList::new([dead.uri(), also_dead.uri()]).unwrap();

        assert_eq!(list.refresh().await, also_dead.uri());
        assert_eq!(list.refresh().await, dead.uri());
    }
}
