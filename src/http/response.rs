//! Admission response metadata.
//!
//! # Responsibilities
//! - Name the headers admission adds to responses
//! - Render rate-limit and quota metadata onto a response
//! - Build the structured 429 body for rejected requests
//!
//! # Design Decisions
//! - Reset instants go out as Unix epoch seconds
//! - Unlimited quota windows get no remaining/reset header at all
//! - The body carries the same `retry_after` as the `Retry-After` header

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Rejection, RejectionReason};
use crate::quota::throttle::QuotaState;
use crate::security::rate_limit::RateLimitDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_THROTTLE_DELAY: HeaderName = HeaderName::from_static("x-throttle-delay");
pub const X_QUOTA_DAILY_REMAINING: HeaderName = HeaderName::from_static("x-quota-daily-remaining");
pub const X_QUOTA_MONTHLY_REMAINING: HeaderName =
    HeaderName::from_static("x-quota-monthly-remaining");
pub const X_QUOTA_DAILY_RESET: HeaderName = HeaderName::from_static("x-quota-daily-reset");
pub const X_QUOTA_MONTHLY_RESET: HeaderName = HeaderName::from_static("x-quota-monthly-reset");

/// JSON body of a 429 response.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionBody {
    pub error: &'static str,
    pub reason: RejectionReason,
    pub detail: String,
    pub retry_after: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

impl RejectionBody {
    pub fn new(rejection: &Rejection, retry_after: u64) -> Self {
        let limit = match rejection {
            Rejection::AdmissionDenied { limit, .. } | Rejection::QuotaExceeded { limit, .. } => {
                *limit
            }
        };
        Self {
            error: "too_many_requests",
            reason: rejection.reason(),
            detail: rejection.to_string(),
            retry_after,
            limit,
            reset_at: rejection.reset_at(),
        }
    }
}

/// A rejected request, ready to be sent.
#[derive(Debug, Clone)]
pub struct RejectionResponse {
    body: RejectionBody,
    headers: HeaderMap,
}

impl RejectionResponse {
    pub fn new(rejection: &Rejection, retry_after: u64) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        Self {
            body: RejectionBody::new(rejection, retry_after),
            headers,
        }
    }

    /// Extra headers to send along (rate-limit or quota metadata).
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

impl IntoResponse for RejectionResponse {
    fn into_response(self) -> Response {
        (StatusCode::TOO_MANY_REQUESTS, self.headers, Json(self.body)).into_response()
    }
}

/// `X-RateLimit-*` headers.
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, epoch(decision.reset_at));
}

/// `X-Throttle-Delay` and `X-Quota-*` headers.
pub fn insert_quota_headers(headers: &mut HeaderMap, state: &QuotaState) {
    headers.insert(X_THROTTLE_DELAY, HeaderValue::from(state.delay_ms));
    if let Some(daily) = state.remaining.daily {
        headers.insert(X_QUOTA_DAILY_REMAINING, HeaderValue::from(daily));
        headers.insert(X_QUOTA_DAILY_RESET, epoch(state.daily_reset_at));
    }
    if let Some(monthly) = state.remaining.monthly {
        headers.insert(X_QUOTA_MONTHLY_REMAINING, HeaderValue::from(monthly));
        headers.insert(X_QUOTA_MONTHLY_RESET, epoch(state.monthly_reset_at));
    }
}

fn epoch(at: DateTime<Utc>) -> HeaderValue {
    HeaderValue::from(at.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::throttle::Remaining;
    use crate::quota::QuotaPeriod;
    use chrono::TimeZone;

    fn reset() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_rejection_response_shape() {
        let rejection = Rejection::QuotaExceeded {
            period: QuotaPeriod::Daily,
            limit: 100,
            used: 101,
            reset_at: reset(),
        };
        let response = RejectionResponse::new(&rejection, 3600).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3600");

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["reason"], "quota_exceeded_daily");
        assert_eq!(body["retry_after"], 3600);
        assert_eq!(body["limit"], 100);
    }

    #[test]
    fn test_unlimited_window_has_no_quota_headers() {
        let state = QuotaState {
            delay_ms: 250,
            usage_ratio: 0.8,
            remaining: Remaining {
                daily: Some(20),
                monthly: None,
            },
            daily_reset_at: reset(),
            monthly_reset_at: reset(),
        };
        let mut headers = HeaderMap::new();
        insert_quota_headers(&mut headers, &state);

        assert_eq!(headers[X_THROTTLE_DELAY], "250");
        assert_eq!(headers[X_QUOTA_DAILY_REMAINING], "20");
        assert_eq!(headers[X_QUOTA_DAILY_RESET], reset().timestamp().to_string().as_str());
        assert!(!headers.contains_key(X_QUOTA_MONTHLY_REMAINING));
        assert!(!headers.contains_key(X_QUOTA_MONTHLY_RESET));
    }
}
