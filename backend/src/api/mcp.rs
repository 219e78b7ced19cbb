//! MCP Streamable HTTP endpoint handlers.
//!
//! ## Endpoints
//!
//! - `POST /mcp` - Send JSON-RPC requests (returns JSON or SSE)
//! - `OPTIONS /mcp` - Allowed methods, no body

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use opencode_mcp_types::JsonRpcResponse;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::bridge::{Notifier, SseItem, SseSink};
use crate::mcp::handler::{decode_request, streaming_unsupported};
use crate::mcp::{Dispatch, McpHandler, PendingCall};
use crate::state::AppState;

/// Header name for MCP session ID.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Frames buffered between the invocation task and the response body.
const SSE_BUFFER: usize = 64;

/// Extract session ID from headers.
fn get_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Whether the client asked for a live event stream.
fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

fn with_session(mut resp: Response, session_id: Option<&str>) -> Response {
    if let Some(hv) = session_id.and_then(|sid| HeaderValue::from_str(sid).ok()) {
        resp.headers_mut()
            .insert(HeaderName::from_static(MCP_SESSION_ID_HEADER), hv);
    }
    resp
}

fn json_response(response: &JsonRpcResponse, session_id: Option<&str>) -> Response {
    with_session(
        (StatusCode::OK, Json(response.to_value())).into_response(),
        session_id,
    )
}

/// POST /mcp - Handle JSON-RPC requests.
///
/// Returns `application/json`, or `text/event-stream` for a `tools/call`
/// when the `Accept` header asks for it. The `Mcp-Session-Id` header is
/// assigned on initialize and echoed back when it names a known session.
pub async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(response) => return json_response(&response, None),
    };

    let presented = get_session_id(&headers);
    let session_id = match presented {
        Some(ref sid) => match state.sessions().get(sid).await {
            Some(session) => Some(session.id),
            None => {
                // Unknown sessions are not an error.
                debug!("MCP: Unknown session {}, proceeding without one", sid);
                None
            }
        },
        None => None,
    };
    debug!(
        "MCP POST: method={:?}, session={:?}",
        request.method, session_id
    );

    match McpHandler::dispatch(&state, request).await {
        Dispatch::Accepted => StatusCode::ACCEPTED.into_response(),
        Dispatch::Initialized(response, session) => {
            info!("MCP: New session initialized: {}", session.id);
            json_response(&response, Some(&session.id))
        }
        Dispatch::Respond(response) => json_response(&response, session_id.as_deref()),
        Dispatch::Call(call) if wants_event_stream(&headers) => {
            stream_call(call, session_id.as_deref())
        }
        Dispatch::Call(call) => {
            let response = call.aggregate().await;
            json_response(&response, session_id.as_deref())
        }
    }
}

/// Run a tool call in its own task, relaying its notifications as SSE.
fn stream_call(call: PendingCall, session_id: Option<&str>) -> Response {
    let (tx, rx) = mpsc::channel::<SseItem>(SSE_BUFFER);
    let notifier = match Notifier::new(Box::new(SseSink::new(tx)), call.progress_token()) {
        Ok(notifier) => notifier,
        Err(e) => return json_response(&streaming_unsupported(call.id(), &e), session_id),
    };

    tokio::spawn(async move {
        if let Err(e) = call.stream(notifier).await {
            debug!("MCP: SSE stream ended early: {}", e);
        }
    });

    with_session(
        Sse::new(ReceiverStream::new(rx))
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response(),
        session_id,
    )
}

/// OPTIONS /mcp - Endpoint discovery.
pub async fn mcp_options() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ALLOW, "POST, OPTIONS"),
            (header::ACCEPT, "application/json, text/event-stream"),
        ],
    )
}
