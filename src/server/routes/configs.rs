//! Configuration endpoints: pull, publish, register and the long-poll listener

use std::time::Duration;

use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
};
use tracing::{debug, info, instrument};

use crate::model::{ConfigEntry, PoolConfig};
use crate::protocol::{
    self, ConfigQuery, DEFAULT_HOLD, LONG_PULLING_TIMEOUT_HEADER, ListenerRequest, PublishRequest,
    RegisterRequest, RegisterResponse, TENANT_HEADER, WriteAck,
};
use crate::server::error::ApiResult;
use crate::server::state::ServerState;

/// GET /v1/cs/configs?tenant=&item=&pool=
pub async fn pull(
    State(state): State<ServerState>,
    Query(query): Query<ConfigQuery>,
) -> ApiResult<Json<ConfigEntry>> {
    let key = query.group_key()?;
    let entry = state.store.read(&key).await?;
    Ok(Json(entry))
}

/// POST /v1/cs/configs
///
/// Operator write. Parked polls watching the key are woken by the store's
/// change notification.
#[instrument(skip_all, fields(key = %request.group_key))]
pub async fn publish(
    State(state): State<ServerState>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<Json<WriteAck>> {
    request.config.validate()?;
    let entry = state
        .store
        .write(&request.group_key, &request.config.to_content())
        .await?;

    info!(version = entry.version, "published configuration");
    Ok(Json(WriteAck {
        version: entry.version,
        fingerprint: entry.fingerprint,
    }))
}

/// POST /v1/cs/configs/register
///
/// Idempotent. The server copy wins when the key already exists.
#[instrument(skip_all, fields(key = %request.group_key))]
pub async fn register(
    State(state): State<ServerState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    request.config.validate()?;
    let content = request.config.to_content();
    let (entry, created) = state
        .store
        .insert_if_absent(&request.group_key, &content)
        .await?;

    if created {
        info!("registered new pool");
    } else if PoolConfig::from_content(&entry.content).ok().as_ref() != Some(&request.config) {
        debug!(version = entry.version, "pool already registered with different parameters, keeping stored copy");
    }

    Ok(Json(RegisterResponse {
        version: entry.version,
        fingerprint: entry.fingerprint,
        created,
    }))
}

/// POST /v1/cs/configs/listener
///
/// Body carries the encoded probe; the response body lists the changed keys,
/// empty when the hold expired first.
pub async fn listen(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(request): Json<ListenerRequest>,
) -> ApiResult<String> {
    let probe = protocol::decode_probe(&request.probe)?;

    let hold = headers
        .get(LONG_PULLING_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_HOLD);
    let tenant = headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok());

    let changed = state.coordinator.poll(probe, tenant, hold).await?;
    Ok(protocol::encode_keys(&changed))
}
