use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use fcrunner_protocol::Ack;

use super::{internal_error, ok_response, AppState};
use crate::filesystem;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/filesystem/cleanup", post(cleanup))
}

async fn cleanup(State(state): State<Arc<AppState>>) -> Response {
    match filesystem::cleanup(&state.config.logs).await {
        Ok(()) => ok_response(Ack::default()),
        Err(e) => internal_error(&e),
    }
}
