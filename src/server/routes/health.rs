//! Health check endpoint

/// GET /v1/cs/health
///
/// Probed by clients to pick a live server.
pub async fn health_check() -> &'static str {
    "UP"
}
