//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use gatekeeper::admin::setup_admin_router;
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::http::{AppState, HttpServer};
use gatekeeper::lifecycle::Shutdown;

pub const ADMIN_KEY: &str = "integration-admin-key";

/// A running gatekeeper on ephemeral ports.
pub struct TestServer {
    pub addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Shutdown,
    pub client: reqwest::Client,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.admin_addr, path)
    }

    pub fn admin_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.admin_url(path)).bearer_auth(ADMIN_KEY)
    }

    pub fn admin_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.admin_url(path)).bearer_auth(ADMIN_KEY)
    }

    pub fn admin_put(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.put(self.admin_url(path)).bearer_auth(ADMIN_KEY)
    }

    pub fn admin_delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.delete(self.admin_url(path)).bearer_auth(ADMIN_KEY)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Config with admin enabled and limits high enough not to interfere.
pub fn base_config() -> GatekeeperConfig {
    let mut config = GatekeeperConfig::default();
    config.admin.enabled = true;
    config.admin.api_key = ADMIN_KEY.to_string();
    config.rate_limit.ip_limits.requests_per_minute = 10_000;
    config.rate_limit.ip_limits.requests_per_hour = 100_000;
    config.rate_limit.credential_limits.requests_per_minute = 10_000;
    config.rate_limit.credential_limits.requests_per_hour = 100_000;
    config
}

/// Start the public and admin servers with the default protected routes.
pub async fn spawn(config: GatekeeperConfig) -> TestServer {
    spawn_with_routes(config, |_| gatekeeper::http::server::default_routes()).await
}

/// Start the public and admin servers protecting routes built from the state.
pub async fn spawn_with_routes<F>(config: GatekeeperConfig, routes: F) -> TestServer
where
    F: FnOnce(&AppState) -> Router,
{
    let state = AppState::from_config(config).expect("state");
    let shutdown = Shutdown::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::with_routes(state.clone(), routes(&state));
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = admin_listener.local_addr().unwrap();
    let admin = setup_admin_router(state.clone());
    let admin_shutdown = shutdown.signalled();
    tokio::spawn(async move {
        let _ = axum::serve(admin_listener, admin)
            .with_graceful_shutdown(admin_shutdown)
            .await;
    });

    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    TestServer {
        addr,
        admin_addr,
        state,
        shutdown,
        client,
    }
}
