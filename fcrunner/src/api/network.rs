use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use fcrunner_protocol::{Ack, CleanupNetworkRequest, SetupNetworkRequest};
use tracing::{info, warn};

use super::{body, internal_error, invalid_request, ok_response, AppState};
use crate::network::BridgeAddress;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/network/setup", post(setup))
        .route("/network/cleanup", post(cleanup))
}

async fn setup(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SetupNetworkRequest>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let address = match BridgeAddress::parse(&req.bridge_ip, state.config.network.subnet_prefix) {
        Ok(address) => address,
        Err(e) => return invalid_request(format!("{e:#}")),
    };

    let bridge_name = state.config.network.bridge_name.clone();
    let mut network = state.network.lock().await;
    match network.setup(req.vm_count, &bridge_name, address).await {
        Ok(()) => {
            info!(bridge = %bridge_name, %address, taps = network.taps().len(), "network ready");
            ok_response(Ack::default())
        }
        Err(e) => internal_error(&e),
    }
}

/// Always acknowledged; resources that could not be removed are logged.
async fn cleanup(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CleanupNetworkRequest>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    let report = state.network.lock().await.cleanup(req.vm_count).await;
    if !report.is_clean() {
        warn!(failures = ?report.failures, "networking cleanup left resources behind");
    }
    ok_response(Ack::default())
}
