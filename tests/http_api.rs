mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chainops::job::JobState;
use chainops::transport::http::router;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{assert_state, boot, install_pair, scratch_root, wait_for_terminal};

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

#[tokio::test(flavor = "multi_thread")]
async fn submitted_job_runs_and_exposes_status_and_logs() {
    let root = scratch_root();
    install_pair(&root.path().join("plugins"), "ldap");
    let app = boot(root.path(), &[]).await;
    let api = router(Arc::clone(app.service()));

    let (status, ticket) = send(
        &api,
        "POST",
        "/jobs",
        Some(json!({
            "commands": ["ldap.step", "ldap.echo"],
            "payload": {"ldap.step": {"sleepMs": 50}},
            "requestedBy": "ops"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = ticket["id"].as_str().unwrap().to_string();
    assert!(ticket["enqueuedAt"].is_string());

    let finished = wait_for_terminal(app.service(), &id).await;
    assert_state(&finished, JobState::Succeeded);

    let (status, body) = send(&api, "GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["requestedBy"], "ops");
    assert_eq!(body["outcomes"].as_array().unwrap().len(), 2);
    assert_eq!(body["outcomes"][0]["status"], "success");

    let (status, body) = send(&api, "GET", &format!("/jobs/{id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    let lines = body["lines"].as_array().unwrap();
    assert!(lines.iter().any(|l| l.as_str().unwrap().contains("ldap.step started")));

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_requests_map_to_client_errors() {
    let root = scratch_root();
    let app = boot(root.path(), &[]).await;
    let api = router(Arc::clone(app.service()));

    let (status, body) = send(&api, "POST", "/jobs", Some(json!({"commands": ["a", ""]}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("blank"));

    let (status, _) = send(&api, "POST", "/jobs", Some(json!({"payload": {}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&api, "GET", "/jobs/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&api, "GET", "/jobs/does-not-exist/logs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&api, "DELETE", "/jobs/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_job_can_be_modified_and_cancelled_before_it_starts() {
    let root = scratch_root();
    let app = boot(root.path(), &[]).await;
    let api = router(Arc::clone(app.service()));

    let (_, ticket) = send(&api, "POST", "/jobs", Some(json!({"commands": ["a"], "delay": 60000}))).await;
    let id = ticket["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &api,
        "PUT",
        &format!("/jobs/{id}"),
        Some(json!({"commands": ["b", "c"], "delay": 60000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commands"], json!(["b", "c"]));
    assert_eq!(body["status"], "queued");

    let (status, body) = send(&api, "DELETE", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, _) = send(&api, "PUT", &format!("/jobs/{id}"), Some(json!({"commands": ["a"]}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsigned_submission_is_refused_when_a_key_is_configured() {
    let root = scratch_root();
    let key = root.path().join("signing.pub");
    std::fs::write(
        &key,
        "-----BEGIN PUBLIC KEY-----\nMCowBQYDK2VwAyEA+Klv7vc7gbU1FK4AyYp4oN+Dup9hHaCiDTnLqv13Hjk=\n-----END PUBLIC KEY-----\n",
    )
    .unwrap();
    let key = key.to_string_lossy().into_owned();
    let app = boot(root.path(), &[("CHAINOPS_PUBLIC_KEY", key.as_str())]).await;
    let api = router(Arc::clone(app.service()));

    let (status, _) = send(&api, "POST", "/jobs", Some(json!({"commands": ["a"]}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&api, "POST", "/jobs", Some(json!({"commands": ["a"], "signature": "AAAA"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    app.shutdown().await;
}
