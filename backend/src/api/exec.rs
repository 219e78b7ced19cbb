//! Direct execution endpoints, outside the MCP protocol.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use opencode_mcp_types::{ExecRequest, ExecResponse};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::bridge::{CommandSpec, Invocation, RawOutput, SseItem};
use crate::mcp::tools::validate_cwd;
use crate::state::AppState;

fn rejected(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ExecResponse {
            ok: false,
            exit_code: -1,
            error: Some(message.into()),
            ..Default::default()
        }),
    )
        .into_response()
}

/// Validate the request and start the process.
#[allow(clippy::result_large_err)]
fn launch(
    state: &AppState,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<Invocation, Response> {
    let Json(request) = body.map_err(|e| rejected(StatusCode::BAD_REQUEST, e.body_text()))?;
    if request.args.is_empty() {
        return Err(rejected(StatusCode::BAD_REQUEST, "missing args"));
    }
    let cwd = validate_cwd(request.cwd.as_deref())
        .map_err(|e| rejected(StatusCode::BAD_REQUEST, e.to_string()))?;

    let config = state.config();
    debug!("exec: {} {:?}", config.target, request.args);
    let spec = CommandSpec::new(&config.target, request.args, config.timeout)
        .with_cwd(cwd)
        .with_stdin(request.stdin);
    Invocation::launch(state.invoker(), spec).map_err(|e| {
        error!("exec: failed to launch {}: {}", config.target, e);
        rejected(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

fn exec_response(raw: RawOutput) -> ExecResponse {
    let termination = &raw.termination;
    ExecResponse {
        ok: !termination.failed(),
        stdout: raw.stdout,
        stderr: raw.stderr,
        exit_code: termination.exit_code(),
        error: match termination.error() {
            Some(e) => Some(e),
            None if termination.failed() => {
                Some(format!("exit status {}", termination.exit_code()))
            }
            None => None,
        },
    }
}

/// POST /exec - Run the target with raw arguments and return its output.
pub async fn exec(
    State(state): State<AppState>,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> Response {
    let invocation = match launch(&state, body) {
        Ok(invocation) => invocation,
        Err(response) => return response,
    };
    Json(exec_response(invocation.collect().await)).into_response()
}

/// POST /exec/stream - Stream raw stdout lines as SSE `data` frames.
///
/// The stream ends with one `exit` event carrying the final status.
pub async fn exec_stream(
    State(state): State<AppState>,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> Response {
    let invocation = match launch(&state, body) {
        Ok(invocation) => invocation,
        Err(response) => return response,
    };

    let (tx, rx) = mpsc::channel::<SseItem>(64);
    tokio::spawn(async move {
        let raw = invocation.forward_lines(&tx).await;
        if !raw.stderr.is_empty() {
            debug!("exec/stream stderr: {}", raw.stderr.trim_end());
        }
        let summary = exec_response(raw);
        let data = serde_json::to_string(&summary).unwrap_or_default();
        let _ = tx.send(Ok(Event::default().event("exit").data(data))).await;
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
