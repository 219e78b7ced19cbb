//! opencode-mcp library.
//!
//! An MCP bridge to the `opencode-cli` command-line program. This module
//! exposes the application builder for use by the binary and in tests.

use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, Method};
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower::{service_fn, ServiceExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod api;
pub mod bridge;
pub mod config;
pub mod mcp;
pub mod state;
pub mod stdio;

use state::AppState;

/// Create the Axum application router with default state.
pub fn create_app() -> Router {
    create_app_with_state(AppState::default())
}

/// Create the Axum application router with a given state.
///
/// This function is used both by the main server binary and by integration tests.
pub fn create_app_with_state(state: AppState) -> Router {
    let routes: Router = Router::new()
        .route("/health", get(health))
        .route(
            "/mcp",
            post(api::mcp::mcp_post).options(api::mcp::mcp_options),
        )
        .route("/exec", post(api::exec::exec))
        .route("/exec/stream", post(api::exec::exec_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // CorsLayer answers every OPTIONS itself, so only real preflights go
    // through it and a bare OPTIONS reaches the route handler.
    let plain = routes.clone();
    let with_cors = routes.layer(cors_layer());
    Router::new().fallback_service(service_fn(move |req: Request| {
        let target = if req.method() == Method::OPTIONS && !is_preflight(req.headers()) {
            plain.clone()
        } else {
            with_cors.clone()
        };
        target.oneshot(req)
    }))
}

fn cors_layer() -> CorsLayer {
    let session_header = HeaderName::from_static(api::mcp::MCP_SESSION_ID_HEADER);
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, session_header.clone()])
        .expose_headers([session_header])
        .allow_origin(Any)
}

/// A CORS preflight carries both `Origin` and `Access-Control-Request-Method`.
fn is_preflight(headers: &HeaderMap) -> bool {
    headers.contains_key(header::ORIGIN)
        && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

/// Health check endpoint.
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
