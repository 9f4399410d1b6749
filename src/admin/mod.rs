//! Administrative API.
//!
//! Every route sits behind bearer-key auth and answers JSON.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::{admin_auth_middleware, AdminKey};
use self::handlers::*;
use crate::http::server::AppState;

pub use self::handlers::AdminError;

pub fn setup_admin_router(state: AppState) -> Router {
    let key = Arc::new(AdminKey::new(&state.config.admin.api_key));
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/quotas", get(get_usage_report))
        .route(
            "/admin/quotas/{credential}",
            get(get_quota).put(put_quota).delete(delete_quota),
        )
        .route("/admin/quotas/{credential}/reset", post(reset_quota))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/summary", get(get_breaker_summary))
        .route("/admin/breakers/memory", get(get_breaker_memory))
        .route("/admin/breakers/cleanup", post(cleanup_breakers))
        .route("/admin/breakers/{name}/reset", post(reset_breaker))
        .layer(middleware::from_fn_with_state(key, admin_auth_middleware))
        .with_state(state)
}
