//! Integration tests for the HTTP API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{TestEngine, eventually, sample_files, vault_key};
use futures::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test-admin-token";

/// Helper to make JSON requests.
async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

async fn admin(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    json_request(router, method, uri, body, Some(ADMIN_TOKEN)).await
}

#[tokio::test]
async fn test_health_check() {
    let t = TestEngine::new().await;
    let (status, body) = json_request(&t.router(), "GET", "/v1/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.get("status").and_then(|v| v.as_str()), Some("ok"));
}

#[tokio::test]
async fn test_status_of_unknown_and_invalid_vaults() {
    let t = TestEngine::new().await;
    let router = t.router();

    let uri = format!("/v1/vaults/{}/status", vault_key(1).to_hex());
    let (status, body) = json_request(&router, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) =
        json_request(&router, "GET", "/v1/vaults/not-a-key/status", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_status_of_a_loaded_vault() {
    let t = TestEngine::new().await;
    let key = vault_key(2);
    t.opener.publish(&key, sample_files(2, 3));
    t.engine.load_vault(&key).await.unwrap();
    t.archive(&key).download_block(0).await.unwrap();

    let engine = t.engine.clone();
    eventually("progress to reach a quarter", || {
        let engine = engine.clone();
        async move { engine.get_download_progress(&key) > 0.0 }
    })
    .await;
    t.settle().await;

    let uri = format!("/v1/vaults/{}/status", key.to_hex());
    let (status, body) = json_request(&t.router(), "GET", &uri, None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["key"], key.to_hex());
    assert_eq!(body["progress"], 0.25);
    assert_eq!(body["numPeers"], 1);
    assert_eq!(body["isLoading"], false);
}

#[tokio::test]
async fn test_admin_routes_require_the_admin_token() {
    let t = TestEngine::new().await;
    let router = t.router();

    let (status, body) =
        json_request(&router, "GET", "/v1/admin/vaults/popular", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = json_request(
        &router,
        "GET",
        "/v1/admin/vaults/popular",
        None,
        Some("wrong-token"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = admin(&router, "GET", "/v1/admin/vaults/popular", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_user_hosting_lifecycle() {
    let t = TestEngine::new().await;
    let router = t.router();
    let key = vault_key(3);
    t.opener.publish(&key, sample_files(3, 1));

    let (status, user) = admin(
        &router,
        "POST",
        "/v1/admin/users",
        Some(json!({ "id": "alice", "username": "alice", "diskQuota": 1_000_000 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(user["id"], "alice");
    assert_eq!(user["diskQuotaOverride"], 1_000_000);
    assert_eq!(user["diskQuota"], 1_000_000);
    assert_eq!(user["vaults"], json!([]));

    let (status, body) = admin(
        &router,
        "POST",
        "/v1/admin/users",
        Some(json!({ "id": "alice", "username": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");

    let (status, hosted) = admin(
        &router,
        "POST",
        "/v1/admin/users/alice/vaults",
        Some(json!({ "key": key.to_hex(), "name": "photos" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(hosted["ownerName"], "alice");
    assert_eq!(hosted["hostingUsers"], json!(["alice"]));

    let (status, user) = admin(&router, "GET", "/v1/admin/users/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["vaults"][0]["key"], key.to_hex());
    assert_eq!(user["vaults"][0]["name"], "photos");

    let uri = format!("/v1/admin/vaults/{}", key.to_hex());
    let (status, info) = admin(&router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["flockIntent"], json!({ "upload": true, "download": true }));
    assert_eq!(info["stats"]["numFiles"], 3);

    let uri = format!("/v1/admin/users/alice/vaults/{}", key.to_hex());
    let (status, _) = admin(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = admin(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    t.settle().await;
    assert!(t.engine.get_vault(&key).is_none());
}

#[tokio::test]
async fn test_hosting_conflicts_and_validation() {
    let t = TestEngine::new().await;
    let router = t.router();
    let key = vault_key(4);
    t.create_user("alice", None).await;
    t.create_user("bob", None).await;
    t.host("alice", &key).await;

    let body = json!({ "key": key.to_hex() });
    let (status, error) =
        admin(&router, "POST", "/v1/admin/users/bob/vaults", Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["code"], "already_hosted");

    let (status, _) = admin(&router, "POST", "/v1/admin/users/carol/vaults", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = admin(
        &router,
        "POST",
        "/v1/admin/users/bob/vaults",
        Some(json!({ "key": "zz" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = admin(
        &router,
        "POST",
        "/v1/admin/users",
        Some(json!({ "username": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    t.settle().await;
}

#[tokio::test]
async fn test_out_of_space_user_cannot_host() {
    let t = TestEngine::new().await;
    t.create_user("alice", Some(10)).await;
    t.metadata().update_user_disk_usage("alice", 10).await.unwrap();

    let (status, body) = admin(
        &t.router(),
        "POST",
        "/v1/admin/users/alice/vaults",
        Some(json!({ "key": vault_key(5).to_hex() })),
    )
    .await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(body["code"], "out_of_space");
}

#[tokio::test]
async fn test_set_user_quota() {
    let t = TestEngine::new().await;
    let router = t.router();
    t.create_user("alice", None).await;

    let (status, user) = admin(
        &router,
        "PUT",
        "/v1/admin/users/alice/quota",
        Some(json!({ "diskQuota": 4096 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["diskQuotaOverride"], 4096);
    assert_eq!(user["diskQuota"], 4096);

    let (status, user) = admin(
        &router,
        "PUT",
        "/v1/admin/users/alice/quota",
        Some(json!({ "diskQuota": null })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["diskQuotaOverride"], Value::Null);
    assert_eq!(user["diskQuota"], 100 * 1024 * 1024);

    let (status, _) = admin(
        &router,
        "PUT",
        "/v1/admin/users/nobody/quota",
        Some(json!({ "diskQuota": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    t.settle().await;
}

#[tokio::test]
async fn test_admin_vault_removal() {
    let t = TestEngine::new().await;
    let router = t.router();
    let key = vault_key(6);
    t.create_user("alice", None).await;
    t.host("alice", &key).await;

    let uri = format!("/v1/admin/vaults/{}", key.to_hex());
    let (status, body) = admin(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removedUsers"], json!(["alice"]));

    let (status, _) = admin(&router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    t.settle().await;
}

#[tokio::test]
async fn test_run_job() {
    let t = TestEngine::new().await;
    let router = t.router();

    let (status, report) = admin(&router, "POST", "/v1/admin/jobs/popular_index", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["job"], "popular_index");

    let (status, body) = admin(&router, "POST", "/v1/admin/jobs/defragment", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_manifest_appears_once_downloaded() {
    let t = TestEngine::new().await;
    let router = t.router();
    let key = vault_key(7);
    t.opener.publish(&key, sample_files(7, 1));
    t.engine.load_vault(&key).await.unwrap();

    let uri = format!("/v1/vaults/{}/manifest", key.to_hex());
    let (status, _) = json_request(&router, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    t.archive(&key).download_all().await.unwrap();
    let (status, manifest) = json_request(&router, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(manifest.get("title").is_some());
    t.settle().await;
}

#[tokio::test]
async fn test_progress_stream_starts_with_the_current_value() {
    let t = TestEngine::new().await;
    let router = t.router();
    let key = vault_key(8);
    t.opener.publish(&key, sample_files(8, 1));
    t.engine.load_vault(&key).await.unwrap();

    let request = Request::builder()
        .uri(format!("/v1/vaults/{}/progress", key.to_hex()))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("no progress event")
        .unwrap()
        .unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert!(text.contains("event: progress"));
    assert!(text.contains("\"progress\":0"));

    let uri = format!("/v1/vaults/{}/progress", vault_key(9).to_hex());
    let (status, _) = json_request(&router, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = TestEngine::new().await;
    pinfold_server::metrics::register_metrics();

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = t.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("pinfold_"));
}
