use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

/// Expected `Authorization` value.
#[derive(Debug)]
pub struct AdminKey {
    expected: String,
}

impl AdminKey {
    pub fn new(api_key: &str) -> Self {
        Self {
            expected: format!("Bearer {}", api_key),
        }
    }

    /// Constant-time comparison against the presented header value.
    pub fn matches(&self, presented: &str) -> bool {
        self.expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

pub async fn admin_auth_middleware(
    State(key): State<Arc<AdminKey>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match auth_header {
        Some(value) if key.matches(value) => Ok(next.run(request).await),
        _ => {
            tracing::warn!(path = %request.uri().path(), "Rejected admin request");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
