/// Shared-secret guard for `/cron/*`
///
/// The external scheduler sends the configured secret in `x-cron-secret`. Both
/// values are hashed first so the comparison takes the same time whatever the
/// header's length or content.

use crate::{app::AppState, error::ApiError};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Compares the SHA-256 digests of both secrets in constant time
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());

    a.as_slice().ct_eq(b.as_slice()).into()
}

pub async fn cron_secret_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing cron secret".to_string()))?;

    if !secrets_match(provided, &state.config.cron.secret) {
        tracing::warn!(path = %req.uri().path(), "Cron request with wrong secret");
        return Err(ApiError::Unauthorized("Invalid cron secret".to_string()));
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("cron-secret-16-chars", "cron-secret-16-chars"));
        assert!(!secrets_match("cron-secret-16-chars", "cron-secret-16-charz"));
        assert!(!secrets_match("", "cron-secret-16-chars"));
        assert!(!secrets_match("cron-secret-16-chars-and-more", "cron-secret-16-chars"));
    }
}
