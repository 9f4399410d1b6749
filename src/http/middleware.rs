//! Admission middleware.
//!
//! # Responsibilities
//! - Skip excluded paths entirely
//! - Rate limit by client IP and credential
//! - Count quota usage, reject exhausted credentials, hold near-limit ones
//! - Attach rate-limit and quota metadata to the response
//!
//! # Data Flow
//! ```text
//! request
//!     → excluded path?            → next (no checks, no headers)
//!     → RateLimiter               → 429 + Retry-After (configured)
//!     → QuotaThrottle             → 429 + Retry-After (until window reset)
//!     → sleep(delay)              (this request's task only)
//!     → next → response + X-RateLimit-* / X-Quota-* headers
//! ```
//!
//! # Design Decisions
//! - A rate-limited request never reaches the quota counters
//! - The delay is applied inside the request timeout, so an over-long hold ends in 408
//! - Handlers read [`Admission`] from request extensions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderName,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::GatekeeperConfig;
use crate::error::Rejection;
use crate::http::request::RequestIdExt;
use crate::http::response::{insert_quota_headers, insert_rate_limit_headers, RejectionResponse};
use crate::observability::metrics;
use crate::quota::{QuotaThrottle, ThrottleDecision};
use crate::security::rate_limit::credential_prefix;
use crate::security::{ClientIpResolver, RateLimiter};

/// What admission decided about a request that was let through.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub client_ip: String,
    pub credential: Option<String>,
    pub delay_ms: u64,
}

/// Everything the admission middleware needs.
#[derive(Debug)]
pub struct AdmissionControl {
    limiter: Arc<RateLimiter>,
    throttle: Arc<QuotaThrottle>,
    resolver: ClientIpResolver,
    credential_header: HeaderName,
}

impl AdmissionControl {
    pub fn new(
        limiter: Arc<RateLimiter>,
        throttle: Arc<QuotaThrottle>,
        resolver: ClientIpResolver,
        credential_header: HeaderName,
    ) -> Self {
        Self {
            limiter,
            throttle,
            resolver,
            credential_header,
        }
    }

    /// Build from config. The credential header name is validated at load time;
    /// an unparseable one falls back to `x-api-key`.
    pub fn from_config(
        config: &GatekeeperConfig,
        limiter: Arc<RateLimiter>,
        throttle: Arc<QuotaThrottle>,
    ) -> Self {
        let credential_header = HeaderName::try_from(config.credentials.header_name.as_str())
            .unwrap_or_else(|_| HeaderName::from_static("x-api-key"));
        Self::new(
            limiter,
            throttle,
            ClientIpResolver::from_config(&config.rate_limit),
            credential_header,
        )
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn throttle(&self) -> &Arc<QuotaThrottle> {
        &self.throttle
    }

    fn credential(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get(&self.credential_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn retry_after(&self, rejection: &Rejection) -> u64 {
        match rejection {
            Rejection::AdmissionDenied { .. } => self.limiter.config().retry_after_secs,
            Rejection::QuotaExceeded { period, .. } => {
                self.throttle.seconds_until_reset(*period).max(1)
            }
        }
    }
}

/// Admission middleware for `axum::middleware::from_fn_with_state`.
pub async fn admission_middleware(
    State(control): State<Arc<AdmissionControl>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if control.limiter.is_excluded(&path) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = control.resolver.resolve(request.headers(), peer);
    let credential = control.credential(&request);
    let request_id = request.request_id().to_string();

    let rate_limit = if control.limiter.is_enabled() {
        let decision = control
            .limiter
            .check_and_increment(&client_ip, credential.as_deref())
            .await;
        if let Some(rejection) = &decision.rejection {
            tracing::info!(
                request_id = %request_id,
                client_ip = %client_ip,
                reason = rejection.reason().as_str(),
                "Request rejected"
            );
            let mut response = RejectionResponse::new(rejection, control.retry_after(rejection));
            insert_rate_limit_headers(response.headers_mut(), &decision);
            return finish(response.into_response());
        }
        Some(decision)
    } else {
        None
    };

    let quota = if control.throttle.is_excluded(&path) {
        ThrottleDecision::Untracked
    } else {
        control
            .throttle
            .check_and_throttle(credential.as_deref())
            .await
    };

    if let ThrottleDecision::Reject { rejection, state } = &quota {
        tracing::info!(
            request_id = %request_id,
            credential = %credential.as_deref().map(credential_prefix).unwrap_or_default(),
            reason = rejection.reason().as_str(),
            "Request rejected"
        );
        let mut response = RejectionResponse::new(rejection, control.retry_after(rejection));
        if let Some(decision) = &rate_limit {
            insert_rate_limit_headers(response.headers_mut(), decision);
        }
        insert_quota_headers(response.headers_mut(), state);
        return finish(response.into_response());
    }

    let delay_ms = quota.delay_ms();
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    request.extensions_mut().insert(Admission {
        client_ip,
        credential,
        delay_ms,
    });

    let mut response = next.run(request).await;
    if let Some(decision) = &rate_limit {
        insert_rate_limit_headers(response.headers_mut(), decision);
    }
    if let Some(state) = quota.state() {
        insert_quota_headers(response.headers_mut(), state);
    }
    finish(response)
}

fn finish(response: Response) -> Response {
    metrics::record_request(response.status().as_u16());
    response
}

