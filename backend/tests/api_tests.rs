//! Integration tests for the opencode-mcp HTTP API.
//!
//! Tool calls run a small shell script standing in for the real CLI.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use opencode_mcp::config::BridgeConfig;
use opencode_mcp::state::AppState;
use opencode_mcp_types::{ExecResponse, ToolCallResult};
use serde_json::{json, Value};
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use http_body_util::BodyExt;
use tower::ServiceExt; // for `oneshot`

const STUB: &str = r#"#!/bin/sh
case "$1" in
  models)
    echo "openai/o3"
    echo "github-copilot/gpt-4o"
    ;;
  run)
    printf '{"type":"step_start","part":{}}\n'
    printf '{"type":"text","part":{"text":"model=%s"}}\n' "$5"
    printf '{"type":"text","part":{"text":" says hi"}}\n'
    printf '{"type":"step_finish","part":{"reason":"stop"}}\n'
    ;;
  fail)
    echo "boom" >&2
    exit 2
    ;;
  hang)
    exec sleep 30
    ;;
  slow)
    printf '{"type":"text","part":{"text":"working"}}\n'
    sleep 1
    touch "$2"
    ;;
  *)
    echo "$@"
    ;;
esac
"#;

/// A fake `opencode-cli` in a temporary directory.
struct Stub {
    _dir: TempDir,
    path: PathBuf,
}

impl Stub {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("opencode-cli");
        std::fs::write(&path, STUB).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { _dir: dir, path }
    }

    /// A path next to the script, for the script to create.
    fn marker(&self, name: &str) -> PathBuf {
        self.path.with_file_name(name)
    }

    fn app(&self) -> Router {
        self.app_with_timeout(Duration::from_secs(10))
    }

    fn app_with_timeout(&self, timeout: Duration) -> Router {
        opencode_mcp::create_app_with_state(AppState::with_process_invoker(BridgeConfig {
            target: self.path.display().to_string(),
            timeout,
            ..Default::default()
        }))
    }
}

/// Helper to create a test app instance that never launches anything.
fn create_test_app() -> Router {
    opencode_mcp::create_app_with_state(AppState::with_process_invoker(BridgeConfig {
        target: "/nonexistent/opencode-cli".to_string(),
        ..Default::default()
    }))
}

async fn post(app: Router, uri: &str, body: impl Into<Body>, accept: Option<&str>) -> Response {
    let mut builder = Request::builder()
        .uri(uri)
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(accept) = accept {
        builder = builder.header(header::ACCEPT, accept);
    }
    app.oneshot(builder.body(body.into()).unwrap()).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn rpc(app: Router, request: Value) -> Value {
    let response = post(app, "/mcp", request.to_string(), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn tool_call(id: i64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

fn tool_result(response: &Value) -> ToolCallResult {
    assert!(response.get("error").is_none(), "unexpected error: {}", response);
    serde_json::from_value(response["result"].clone()).unwrap()
}

/// `(event name, data)` for every SSE frame in a complete body.
fn sse_frames(body: &[u8]) -> Vec<(Option<String>, String)> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter_map(|frame| {
            let mut event = None;
            let mut data = Vec::new();
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data.push(payload.strip_prefix(' ').unwrap_or(payload).to_string());
                }
            }
            (!data.is_empty()).then(|| (event, data.join("\n")))
        })
        .collect()
}

#[tokio::test]
async fn test_health_check() {
    let app = opencode_mcp::create_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_mcp_options_and_wrong_method() {
    let response = create_test_app()
        .oneshot(
            Request::builder()
                .uri("/mcp")
                .method("OPTIONS")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let allow = response.headers().get(header::ALLOW).unwrap().to_str().unwrap();
    assert!(allow.contains("POST"));

    let response = create_test_app()
        .oneshot(Request::builder().uri("/mcp").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_cors_preflight_and_origin_header() {
    let response = create_test_app()
        .oneshot(
            Request::builder()
                .uri("/mcp")
                .method("OPTIONS")
                .header(header::ORIGIN, "http://example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
    assert!(response.headers().get(header::ALLOW).is_none());

    let response = create_test_app()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "http://example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_protocol_error_codes() {
    let response = post(create_test_app(), "/mcp", "{not json", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert!(body["id"].is_null());

    let body = rpc(create_test_app(), json!({"jsonrpc": "2.0", "id": 1})).await;
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], 1);

    let body = rpc(
        create_test_app(),
        json!({"jsonrpc": "2.0", "id": 2, "method": "prompts/list"}),
    )
    .await;
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn test_notification_is_accepted_without_body() {
    let response = post(
        create_test_app(),
        "/mcp",
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_initialize_assigns_session() {
    let app = create_test_app();
    let response = post(
        app.clone(),
        "/mcp",
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}).to_string(),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let session = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(session.len(), 32);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["result"]["serverInfo"]["name"], "opencode-mcp");

    // The same router shares state, so the session is echoed back
    let response = app
        .oneshot(
            Request::builder()
                .uri("/mcp")
                .method("POST")
                .header(header::CONTENT_TYPE, "application/json")
                .header("mcp-session-id", &session)
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("mcp-session-id").unwrap(),
        session.as_str()
    );
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"opencode_run"));
    assert!(names.contains(&"opencode_exec"));
}

#[tokio::test]
async fn test_invalid_cwd_is_rejected() {
    let body = rpc(
        create_test_app(),
        tool_call(3, "opencode_run", json!({"message": "hi", "cwd": "/no/such/dir"})),
    )
    .await;
    assert_eq!(body["error"]["code"], -32602);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("invalid cwd"));
}

#[tokio::test]
#[serial]
async fn test_missing_program_is_internal_error() {
    let body = rpc(
        create_test_app(),
        tool_call(4, "opencode_exec", json!({"args": ["--version"]})),
    )
    .await;
    assert_eq!(body["error"]["code"], -32603);
}

#[tokio::test]
#[serial]
async fn test_models_tool_returns_raw_listing() {
    let stub = Stub::new();
    let body = rpc(stub.app(), tool_call(5, "opencode_models", json!({}))).await;
    let result = tool_result(&body);
    assert!(!result.is_error);
    assert_eq!(result.text(), "openai/o3\ngithub-copilot/gpt-4o");
}

#[tokio::test]
#[serial]
async fn test_run_uses_discovered_model() {
    let stub = Stub::new();
    let body = rpc(stub.app(), tool_call(6, "opencode_run", json!({"message": "hello"}))).await;
    let result = tool_result(&body);
    assert!(!result.is_error);
    assert_eq!(result.text(), "model=github-copilot/gpt-4o says hi");
}

#[tokio::test]
#[serial]
async fn test_failed_command_reports_stderr_and_exit_code() {
    let stub = Stub::new();
    let body = rpc(stub.app(), tool_call(7, "opencode_exec", json!({"args": ["fail"]}))).await;
    let result = tool_result(&body);
    assert!(result.is_error);
    assert_eq!(result.text(), "[stderr]\nboom\n[exit code: 2]");
}

#[tokio::test]
#[serial]
async fn test_timeout_kills_the_process() {
    let stub = Stub::new();
    let app = stub.app_with_timeout(Duration::from_millis(300));
    let started = std::time::Instant::now();
    let body = rpc(app, tool_call(8, "opencode_exec", json!({"args": ["hang"]}))).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let result = tool_result(&body);
    assert!(result.is_error);
    assert!(result.text().contains("timed out"));
    assert!(result.text().ends_with("[exit code: -1]"));
}

#[tokio::test]
#[serial]
async fn test_tool_call_streams_sse() {
    let stub = Stub::new();
    let mut request = tool_call(9, "opencode_run", json!({"message": "x", "model": "m1"}));
    request["params"]["_meta"] = json!({"progressToken": "tok"});

    let response = post(
        stub.app(),
        "/mcp",
        request.to_string(),
        Some("application/json, text/event-stream"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let frames = sse_frames(&body_bytes(response).await);
    let messages: Vec<Value> = frames
        .iter()
        .map(|(_, data)| serde_json::from_str(data).unwrap())
        .collect();
    let (last, notifications) = messages.split_last().unwrap();

    assert!(!notifications.is_empty());
    assert!(notifications.iter().all(|m| m.get("id").is_none()));
    assert!(notifications
        .iter()
        .any(|m| m["method"] == "notifications/message" && m["params"]["data"] == "model=m1"));
    assert!(notifications.iter().any(|m| {
        m["method"] == "notifications/progress" && m["params"]["progressToken"] == "tok"
    }));

    assert_eq!(last["id"], 9);
    assert_eq!(
        last["result"]["content"][0]["text"],
        "model=m1 says hi"
    );
}

#[tokio::test]
#[serial]
async fn test_sse_timeout_is_the_final_frame() {
    let stub = Stub::new();
    let response = post(
        stub.app_with_timeout(Duration::from_millis(300)),
        "/mcp",
        tool_call(10, "opencode_exec", json!({"args": ["hang"]})).to_string(),
        Some("text/event-stream"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let frames = sse_frames(&body_bytes(response).await);
    let last: Value = serde_json::from_str(&frames.last().unwrap().1).unwrap();
    assert_eq!(last["id"], 10);
    assert_eq!(last["result"]["isError"], true);
    let text = last["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("[timed out after 300ms]"), "{}", text);
}

#[tokio::test]
#[serial]
async fn test_sse_disconnect_kills_the_process() {
    let stub = Stub::new();
    let marker = stub.marker("finished");
    let response = post(
        stub.app(),
        "/mcp",
        tool_call(
            11,
            "opencode_exec",
            json!({"args": ["slow", marker.display().to_string()]}),
        )
        .to_string(),
        Some("text/event-stream"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Wait for the first frame so the process is known to be running.
    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert!(first.is_data());
    drop(body);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!marker.exists());
}

#[tokio::test]
#[serial]
async fn test_exec_endpoint() {
    let stub = Stub::new();
    let response = post(
        stub.app(),
        "/exec",
        json!({"args": ["hello", "world"]}).to_string(),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: ExecResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(body.ok);
    assert_eq!(body.stdout, "hello world\n");
    assert_eq!(body.exit_code, 0);

    let response = post(
        stub.app(),
        "/exec",
        json!({"args": ["fail"]}).to_string(),
        None,
    )
    .await;
    let body: ExecResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(!body.ok);
    assert_eq!(body.stderr, "boom\n");
    assert_eq!(body.exit_code, 2);
}

#[tokio::test]
async fn test_exec_rejects_bad_requests() {
    let response = post(create_test_app(), "/exec", json!({"args": []}).to_string(), None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = post(create_test_app(), "/exec", "{oops", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ExecResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(!body.ok);
    assert!(body.error.is_some());

    let response = post(
        create_test_app(),
        "/exec",
        json!({"args": ["x"], "cwd": "/no/such/dir"}).to_string(),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[serial]
async fn test_exec_stream_ends_with_exit_event() {
    let stub = Stub::new();
    let response = post(
        stub.app(),
        "/exec/stream",
        json!({"args": ["run", "--format", "json", "--model", "m2", "x"]}).to_string(),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let frames = sse_frames(&body_bytes(response).await);
    let (last, lines) = frames.split_last().unwrap();
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().all(|(event, _)| event.is_none()));
    assert!(lines[1].1.contains("model=m2"));

    assert_eq!(last.0.as_deref(), Some("exit"));
    let summary: ExecResponse = serde_json::from_str(&last.1).unwrap();
    assert!(summary.ok);
    assert_eq!(summary.exit_code, 0);
}
