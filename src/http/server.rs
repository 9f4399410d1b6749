//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Assemble the shared components (counters, limiter, throttle, coordinator)
//! - Create the Axum router: caller routes behind admission, plus `/health`
//! - Wire up middleware (request ID, tracing, timeout, admission)
//! - Serve with client addresses available and stop on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::GatekeeperConfig;
use crate::http::middleware::{admission_middleware, Admission, AdmissionControl};
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, RequestIdExt};
use crate::lifecycle::Shutdown;
use crate::quota::{
    JsonFileRepository, QuotaConfigStore, QuotaRepository, QuotaThrottle, RepositoryError,
};
use crate::resilience::{BreakerRegistry, ExecutionCoordinator, HealthStatus};
use crate::security::RateLimiter;
use crate::store::{CounterStore, MemoryCounterStore};

/// Shared components, injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatekeeperConfig>,
    pub counters: Arc<dyn CounterStore>,
    pub limiter: Arc<RateLimiter>,
    pub throttle: Arc<QuotaThrottle>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub admission: Arc<AdmissionControl>,
    pub started_at: Instant,
}

impl AppState {
    /// Build every component from config, opening the quota file if one is configured.
    pub fn from_config(config: GatekeeperConfig) -> Result<Self, RepositoryError> {
        let repository: Arc<dyn QuotaRepository> = match &config.throttle.persistence_path {
            Some(path) => Arc::new(JsonFileRepository::open(path)?),
            None => Arc::new(JsonFileRepository::in_memory()),
        };
        Ok(Self::with_backends(
            config,
            Arc::new(MemoryCounterStore::new()),
            repository,
        ))
    }

    /// Build with explicit counter and quota backends.
    pub fn with_backends(
        config: GatekeeperConfig,
        counters: Arc<dyn CounterStore>,
        repository: Arc<dyn QuotaRepository>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            Some(counters.clone()),
        ));
        let configs = Arc::new(QuotaConfigStore::new(
            repository,
            config.throttle.default_quotas,
            Duration::from_secs(config.throttle.config_cache_ttl_secs),
        ));
        let throttle = Arc::new(QuotaThrottle::new(
            config.throttle.clone(),
            Some(counters.clone()),
            configs,
        ));
        let registry = Arc::new(BreakerRegistry::new(config.fault_tolerance.clone()));
        let coordinator = Arc::new(ExecutionCoordinator::new(registry));
        let admission = Arc::new(AdmissionControl::from_config(
            &config,
            limiter.clone(),
            throttle.clone(),
        ));

        Self {
            config: Arc::new(config),
            counters,
            limiter,
            throttle,
            coordinator,
            admission,
            started_at: Instant::now(),
        }
    }
}

/// Public (admission-controlled) HTTP server.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Server whose only protected route echoes the admission outcome.
    pub fn new(state: AppState) -> Self {
        Self::with_routes(state, default_routes())
    }

    /// Server protecting the caller's `routes`.
    pub fn with_routes(state: AppState, routes: Router) -> Self {
        let router = build_router(&state, routes);
        Self { router, state }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the server, accepting connections on the given listener until shutdown.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.signalled())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Wrap `routes` with admission and the standard layers, and add `/health`.
#[allow(deprecated)]
pub fn build_router(state: &AppState, routes: Router) -> Router {
    let health = Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone());

    routes
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.admission.clone(),
            admission_middleware,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.listener.request_timeout_secs,
        )))
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            tracing::info_span!(
                "request",
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request.request_id(),
            )
        }))
        .layer(set_request_id_layer())
}

/// Protected routes used when the embedder supplies none.
pub fn default_routes() -> Router {
    Router::new()
        .route("/", get(admitted_handler))
        .fallback(admitted_handler)
}

async fn admitted_handler(
    admission: Option<Extension<Admission>>,
    request: Request,
) -> impl IntoResponse {
    let Some(Extension(admission)) = admission else {
        return Json(json!({ "status": "admitted", "path": request.uri().path() }));
    };
    Json(json!({
        "status": "admitted",
        "path": request.uri().path(),
        "request_id": request.request_id(),
        "client_ip": admission.client_ip,
        "throttle_delay_ms": admission.delay_ms,
    }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.coordinator.health_summary();
    let status = match summary.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(summary))
}
