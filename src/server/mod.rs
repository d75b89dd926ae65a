//! Config server
//!
//! ## Endpoints
//!
//! - `GET /v1/cs/health` - Health check (never authenticated)
//! - `GET /v1/cs/configs` - Pull one configuration entry
//! - `POST /v1/cs/configs` - Publish new content
//! - `POST /v1/cs/configs/listener` - Long-poll for changed keys
//! - `POST /v1/cs/configs/register` - Idempotent pool registration
//! - `GET|POST /v1/cs/monitor` - Runtime state reports

pub mod auth;
pub mod error;
pub mod longpoll;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use longpoll::LongPollCoordinator;
pub use state::ServerState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::protocol::{
    CONFIGS_PATH, DEFAULT_HOLD, HEALTH_PATH, LISTENER_PATH, MONITOR_PATH, REGISTER_PATH,
};
use crate::storage::ConfigStore;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: SocketAddr,

    /// When set, every endpoint but health requires this bearer token
    pub auth_token: Option<String>,

    /// Longest time a listener request is held open
    pub max_hold: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_token: None,
            max_hold: DEFAULT_HOLD,
        }
    }
}

/// A running server
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub state: ServerState,
    cancel: CancellationToken,
}

impl ServerHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and stop the long-poll watcher.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub fn router(state: ServerState, auth_token: Option<String>) -> Router {
    let mut protected = Router::new()
        .route(
            CONFIGS_PATH,
            get(routes::configs::pull).post(routes::configs::publish),
        )
        .route(LISTENER_PATH, post(routes::configs::listen))
        .route(REGISTER_PATH, post(routes::configs::register))
        .route(
            MONITOR_PATH,
            get(routes::monitor::list_reports).post(routes::monitor::report),
        );

    if let Some(token) = auth_token {
        protected = protected.route_layer(axum::middleware::from_fn_with_state(
            auth::AccessToken::new(token),
            auth::require_token,
        ));
    }

    Router::new()
        .route(HEALTH_PATH, get(routes::health::health_check))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the config server and its long-poll watcher in background tasks.
pub async fn spawn_server(
    settings: ServerSettings,
    store: Arc<dyn ConfigStore>,
) -> anyhow::Result<ServerHandle> {
    info!("starting config server on {}", settings.bind_addr);

    let cancel = CancellationToken::new();
    let coordinator = Arc::new(LongPollCoordinator::new(
        Arc::clone(&store),
        settings.max_hold,
    ));
    coordinator.spawn(cancel.child_token());

    let state = ServerState::new(store, coordinator);
    let app = router(state.clone(), settings.auth_token);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("config server listening on {addr}");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!("config server error: {e}");
        }
    });

    Ok(ServerHandle {
        addr,
        state,
        cancel,
    })
}
