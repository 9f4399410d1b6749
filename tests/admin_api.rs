//! Admin API over real HTTP.

use gatekeeper::http::AppState;
use gatekeeper::quota::UsageSyncer;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

mod common;

async fn send_with_key(server: &common::TestServer, key: &str) -> StatusCode {
    server
        .client
        .get(server.url("/"))
        .header("x-api-key", key)
        .send()
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_admin_requires_key() {
    let server = common::spawn(common::base_config()).await;

    let res = server.client.get(server.admin_url("/admin/status")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server
        .client
        .get(server.admin_url("/admin/status"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server.admin_get("/admin/status").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "operational");
    assert_eq!(body["rate_limit_enabled"], true);
    assert_eq!(body["breakers"]["status"], "unknown");
}

#[tokio::test]
async fn test_usage_is_visible_and_resettable() {
    let server = common::spawn(common::base_config()).await;
    for _ in 0..3 {
        assert_eq!(send_with_key(&server, "tenant-a-key").await, StatusCode::OK);
    }
    assert_eq!(send_with_key(&server, "tenant-b-key").await, StatusCode::OK);

    let body: Value = server
        .admin_get("/admin/quotas/tenant-a-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["usage"]["daily_used"], 3);
    assert_eq!(body["usage"]["monthly_used"], 3);
    assert_eq!(body["remaining"]["daily"], 9_997);
    assert!(body["usage"]["last_request_time"].is_string());

    let report: Value = server
        .admin_get("/admin/quotas?sort=daily&limit=10")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["total"], 2);
    assert_eq!(report["entries"][0]["credential_id"], "tenant-a-key");
    assert_eq!(report["entries"][1]["daily_used"], 1);

    let res = server
        .admin_post("/admin/quotas/tenant-a-key/reset?period=daily")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = server
        .admin_get("/admin/quotas/tenant-a-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["usage"]["daily_used"], 0);
    assert_eq!(body["usage"]["monthly_used"], 3);

    let res = server
        .admin_post("/admin/quotas/tenant-a-key/reset?period=weekly")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_quota_update_takes_effect_immediately() {
    let server = common::spawn(common::base_config()).await;

    let res = server
        .admin_put("/admin/quotas/limited-key")
        .json(&json!({ "daily_limit": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let config: Value = res.json().await.unwrap();
    assert_eq!(config["daily_limit"], 1);
    assert_eq!(config["is_default"], false);

    assert_eq!(send_with_key(&server, "limited-key").await, StatusCode::OK);
    assert_eq!(
        send_with_key(&server, "limited-key").await,
        StatusCode::TOO_MANY_REQUESTS
    );

    let res = server.admin_delete("/admin/quotas/limited-key").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(send_with_key(&server, "limited-key").await, StatusCode::OK);
}

#[tokio::test]
async fn test_throttle_disabled_credential_is_not_counted() {
    let server = common::spawn(common::base_config()).await;
    server
        .admin_put("/admin/quotas/exempt-key")
        .json(&json!({ "throttle_enabled": false }))
        .send()
        .await
        .unwrap();

    let res = server
        .client
        .get(server.url("/"))
        .header("x-api-key", "exempt-key")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(!res.headers().contains_key("x-throttle-delay"));

    let body: Value = server
        .admin_get("/admin/quotas/exempt-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["usage"]["daily_used"], 0);
}

#[tokio::test]
async fn test_quota_configs_and_usage_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::base_config();
    config.throttle.persistence_path = Some(dir.path().join("quotas.json").display().to_string());

    let server = common::spawn(config.clone()).await;
    server
        .admin_put("/admin/quotas/durable-key")
        .json(&json!({ "monthly_limit": null, "priority": 8 }))
        .send()
        .await
        .unwrap();
    assert_eq!(send_with_key(&server, "durable-key").await, StatusCode::OK);

    let syncer = UsageSyncer::new(server.state.throttle.clone(), Duration::from_secs(60));
    assert_eq!(syncer.sync_once().await.unwrap(), 1);
    drop(server);

    let restarted = AppState::from_config(config).unwrap();
    let stored = restarted.throttle.get_quota_config("durable-key");
    assert_eq!(stored.priority, 8);
    assert_eq!(stored.monthly_limit, None);
    assert!(!stored.is_default);

    let usage = restarted
        .throttle
        .configs()
        .repository()
        .usage_snapshot("durable-key")
        .unwrap()
        .expect("snapshot");
    assert_eq!(usage.daily_count, 1);
}
