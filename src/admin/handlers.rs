use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::http::server::AppState;
use crate::quota::throttle::QuotaStatus;
use crate::quota::{
    QuotaConfig, QuotaConfigUpdate, QuotaPeriod, RepositoryError, ResetPeriod, UsageReport,
};
use crate::resilience::{BreakerStatus, CleanupReport, HealthSummary, MemoryUsageSummary};
use crate::security::rate_limit::credential_prefix;
use crate::store::StoreError;

const DEFAULT_REPORT_LIMIT: usize = 50;
const MAX_REPORT_LIMIT: usize = 1000;

/// Admin failures, mapped to HTTP status codes.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl AdminError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdminError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Admin request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub rate_limit_enabled: bool,
    pub throttle_enabled: bool,
    pub active_executions: usize,
    pub shutting_down: bool,
    pub breakers: HealthSummary,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let coordinator = &state.coordinator;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if coordinator.is_shutting_down() {
            "shutting_down"
        } else {
            "operational"
        },
        uptime_secs: state.started_at.elapsed().as_secs(),
        rate_limit_enabled: state.limiter.is_enabled(),
        throttle_enabled: state.throttle.is_enabled(),
        active_executions: coordinator.active_executions(),
        shutting_down: coordinator.is_shutting_down(),
        breakers: coordinator.health_summary(),
    })
}

pub async fn get_quota(
    State(state): State<AppState>,
    Path(credential): Path<String>,
) -> Result<Json<QuotaStatus>, AdminError> {
    Ok(Json(state.throttle.quota_status(&credential).await?))
}

pub async fn put_quota(
    State(state): State<AppState>,
    Path(credential): Path<String>,
    Json(update): Json<QuotaConfigUpdate>,
) -> Result<Json<QuotaConfig>, AdminError> {
    if update.is_empty() {
        return Err(AdminError::BadRequest(
            "update must set at least one field".to_string(),
        ));
    }
    Ok(Json(state.throttle.set_quota_config(&credential, &update)?))
}

#[derive(Serialize)]
pub struct DeletedQuota {
    pub removed: bool,
    pub config: QuotaConfig,
}

pub async fn delete_quota(
    State(state): State<AppState>,
    Path(credential): Path<String>,
) -> Result<Json<DeletedQuota>, AdminError> {
    let removed = state.throttle.delete_quota_config(&credential)?;
    if removed {
        tracing::info!(credential = %credential_prefix(&credential), "Quota config reverted to defaults");
    }
    Ok(Json(DeletedQuota {
        removed,
        config: state.throttle.get_quota_config(&credential),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    #[serde(default)]
    pub period: ResetPeriod,
}

pub async fn reset_quota(
    State(state): State<AppState>,
    Path(credential): Path<String>,
    Query(query): Query<ResetQuery>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let removed = state.throttle.reset_usage(&credential, query.period).await?;
    Ok(Json(json!({
        "credential_id": credential,
        "period": query.period,
        "keys_removed": removed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub sort: Option<QuotaPeriod>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn get_usage_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<UsageReport>, AdminError> {
    let limit = query.limit.unwrap_or(DEFAULT_REPORT_LIMIT);
    if limit == 0 || limit > MAX_REPORT_LIMIT {
        return Err(AdminError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_REPORT_LIMIT
        )));
    }
    let report = state
        .throttle
        .usage_report(
            query.sort.unwrap_or(QuotaPeriod::Daily),
            limit,
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(report))
}

pub async fn get_breakers(State(state): State<AppState>) -> Json<Vec<BreakerStatus>> {
    Json(state.coordinator.breaker_statuses())
}

pub async fn get_breaker_summary(State(state): State<AppState>) -> Json<HealthSummary> {
    Json(state.coordinator.health_summary())
}

pub async fn get_breaker_memory(State(state): State<AppState>) -> Json<MemoryUsageSummary> {
    Json(state.coordinator.memory_usage_summary())
}

pub async fn cleanup_breakers(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, CleanupReport>> {
    Json(state.coordinator.force_cleanup_all())
}

pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    if !state.coordinator.reset_breaker(&name) {
        return Err(AdminError::NotFound(format!("breaker '{}'", name)));
    }
    Ok(Json(json!({ "resource": name, "state": "closed" })))
}
