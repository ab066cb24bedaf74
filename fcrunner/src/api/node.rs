use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use fcrunner_protocol::{Ack, CommandOutput, NodeCommandRequest};
use tracing::info;

use super::{body, internal_error, invalid_request, ok_response, AppState};
use crate::capture::CommandLine;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/node/server-command", post(send_server_command))
        .route("/node/client-command", post(send_client_command))
        .route("/node/syscalls/stop", post(stop_syscalls))
        .route("/node/cleanup", post(cleanup))
}

fn command_line(
    payload: Result<Json<NodeCommandRequest>, JsonRejection>,
) -> Result<CommandLine, Response> {
    let req = body(payload)?;
    CommandLine::from_argv(req.command).map_err(|e| invalid_request(e.to_string()))
}

async fn send_server_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NodeCommandRequest>, JsonRejection>,
) -> Response {
    let cmd = match command_line(payload) {
        Ok(cmd) => cmd,
        Err(resp) => return resp,
    };
    match state.node().await.send_server_command(&cmd).await {
        Ok(_pid) => ok_response(Ack::default()),
        Err(e) => internal_error(&e),
    }
}

async fn send_client_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NodeCommandRequest>, JsonRejection>,
) -> Response {
    let cmd = match command_line(payload) {
        Ok(cmd) => cmd,
        Err(resp) => return resp,
    };
    match state.node().await.send_client_command(&cmd).await {
        Ok(()) => ok_response(CommandOutput::finished()),
        Err(e) => internal_error(&e),
    }
}

async fn stop_syscalls(State(state): State<Arc<AppState>>) -> Response {
    state.node().await.stop_syscalls().await;
    ok_response(Ack::default())
}

/// Kill stray benchmark processes, stop everything the node started and
/// begin again with fresh state.
async fn cleanup(State(state): State<Arc<AppState>>) -> Response {
    state.node().await.kill_strays().await;
    let old = match state.replace_node().await {
        Ok(old) => old,
        Err(e) => return internal_error(&e),
    };
    old.shutdown().await;
    info!("node state reset");
    ok_response(Ack::default())
}

#[cfg(test)]
mod tests {
    use super::super::build_router;
    use super::super::tests::{post_json, test_state};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path()));

        let (status, body) =
            post_json(router, "/node/server-command", json!({"command": []})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_client_command_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let (status, body) = post_json(
            build_router(state.clone()),
            "/node/client-command",
            json!({"command": ["/bin/sh", "-c", "echo done"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["output"], "Command finished executing");

        let log = std::fs::read_to_string(dir.path().join("node-logs/node-client.log")).unwrap();
        assert_eq!(log, "[STDOUT] done\n");
        state.node().await.shutdown().await;
    }
}
