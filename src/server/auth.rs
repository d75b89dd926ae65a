//! Access token check for the config and monitor endpoints

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::error::{ApiError, ApiResult};

/// Token shared by the server and its clients
#[derive(Clone)]
pub struct AccessToken(Arc<str>);

impl AccessToken {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    fn matches(&self, presented: &str) -> bool {
        *self.0 == *presented
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("missing access token".to_string()))?;

    value
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("expected `Bearer <token>`".to_string()))
}

pub async fn require_token(
    State(token): State<AccessToken>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let presented = bearer_token(request.headers())?;
    if !token.matches(presented) {
        debug!(path = %request.uri().path(), "rejected request with unknown token");
        return Err(ApiError::Forbidden("access token not accepted".to_string()));
    }

    Ok(next.run(request).await)
}
