use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::Value as JsonValue;
use tower::ServiceExt;

use super::{AppState, app};
use crate::config::ServerConfig;
use crate::session::SessionManager;

/// Router wired to a manager that has no sessions and cannot find an
/// Engine; covers every surface reachable without a worker process.
fn test_app() -> (Router, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = ServerConfig {
        workspace_root: Some(temp.path().to_path_buf()),
        // A real directory with no Stata binary inside: engine
        // detection resolves to "unavailable" deterministically.
        stata_path: Some(temp.path().to_path_buf()),
        ..ServerConfig::default()
    };
    let state = AppState::new(Arc::new(SessionManager::new(config)));
    (app(state), temp)
}

async fn request(
    router: Router,
    method: &str,
    uri: &str,
    body: Option<JsonValue>,
) -> (StatusCode, JsonValue) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    };
    let response = router.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    let json = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
    (status, json)
}

#[tokio::test]
async fn health_reports_server_up_with_engine_unavailable() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], JsonValue::Bool(true));
    assert_eq!(body["engine_available"], JsonValue::Bool(false));
}

#[tokio::test]
async fn session_listing_starts_empty_with_slots_free() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "GET", "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().map(Vec::len), Some(0));
    assert_eq!(body["max_sessions"], serde_json::json!(100));
    assert_eq!(body["available_slots"], serde_json::json!(100));
    assert_eq!(body["multi_session_enabled"], JsonValue::Bool(true));
}

#[tokio::test]
async fn unknown_session_detail_is_not_found() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "GET", "/sessions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], serde_json::json!("session_not_found"));
}

#[tokio::test]
async fn destroying_unknown_session_is_idempotent() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "DELETE", "/sessions/nope", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], serde_json::json!("success"));
    assert_eq!(body["destroyed"], JsonValue::Bool(false));
}

#[tokio::test]
async fn graph_lookup_without_any_session_is_not_found() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "GET", "/graphs/graph1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], serde_json::json!("session_not_found"));
}

#[tokio::test]
async fn empty_selection_is_a_bad_request() {
    let (router, _temp) = test_app();
    let (status, body) = request(
        router,
        "POST",
        "/run_selection",
        Some(serde_json::json!({"selection": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], serde_json::json!("bad_request"));
}

#[tokio::test]
async fn zero_timeout_is_a_bad_request() {
    let (router, _temp) = test_app();
    let (status, body) = request(
        router,
        "POST",
        "/run_selection",
        Some(serde_json::json!({"selection": "display 42", "timeout": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], serde_json::json!("bad_request"));
}

#[tokio::test]
async fn run_file_requires_file_path_parameter() {
    let (router, _temp) = test_app();
    let (status, _body) = request(router, "GET", "/run_file", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn execution_status_defaults_to_ready_before_any_session() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "GET", "/execution_status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], serde_json::json!("ready"));
    assert_eq!(body["session_id"], serde_json::json!("default"));
    assert_eq!(body["elapsed_ms"], serde_json::json!(0));
}

#[tokio::test]
async fn stop_execution_without_a_session_reports_no_execution() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "POST", "/stop_execution", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], serde_json::json!("no_execution"));
}

#[tokio::test]
async fn stop_execution_on_unknown_session_is_not_found() {
    let (router, _temp) = test_app();
    let (status, body) =
        request(router, "POST", "/stop_execution?session_id=nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], serde_json::json!("session_not_found"));
}

#[tokio::test]
async fn unknown_tool_invocation_reports_error_in_band() {
    let (router, _temp) = test_app();
    let (status, body) = request(
        router,
        "POST",
        "/v1/tools",
        Some(serde_json::json!({"tool": "stata_do_magic", "parameters": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], serde_json::json!("error"));
    assert!(
        body["message"]
            .as_str()
            .is_some_and(|message| message.contains("Unknown tool")),
        "unexpected body: {body}"
    );
}

#[tokio::test]
async fn tool_invocation_requires_selection_parameter() {
    let (router, _temp) = test_app();
    let (status, body) = request(
        router,
        "POST",
        "/v1/tools",
        Some(serde_json::json!({"tool": "run_selection", "parameters": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], serde_json::json!("error"));
    assert!(
        body["message"]
            .as_str()
            .is_some_and(|message| message.contains("selection")),
        "unexpected body: {body}"
    );
}

#[tokio::test]
async fn clear_history_resets_the_counter() {
    let (router, _temp) = test_app();
    let (status, body) = request(router, "POST", "/clear_history", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], serde_json::json!("success"));
}
