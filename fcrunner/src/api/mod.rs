pub mod filesystem;
pub mod network;
pub mod node;
pub mod vm;

use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::network::NetworkController;
use crate::node::Node;
use crate::vm::{VmError, VmManager};

/// Shared state for all handlers, passed via axum `State`.
///
/// The VM manager and the node are swapped out wholesale by their cleanup
/// routes; handlers clone the current `Arc` and release the lock before
/// doing any work.
pub struct AppState {
    pub config: Arc<Config>,
    vms: RwLock<Arc<VmManager>>,
    node: RwLock<Arc<Node>>,
    network: Mutex<NetworkController>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let vms = VmManager::new(&config)?;
        let node = Node::new(&config)?;
        let network = NetworkController::new(config.network.clone());
        Ok(Self {
            config: Arc::new(config),
            vms: RwLock::new(Arc::new(vms)),
            node: RwLock::new(Arc::new(node)),
            network: Mutex::new(network),
        })
    }

    pub async fn vms(&self) -> Arc<VmManager> {
        Arc::clone(&*self.vms.read().await)
    }

    /// Install a fresh VM manager and return the old one.
    pub async fn replace_vms(&self) -> Result<Arc<VmManager>> {
        let fresh = Arc::new(VmManager::new(&self.config)?);
        Ok(std::mem::replace(&mut *self.vms.write().await, fresh))
    }

    pub async fn node(&self) -> Arc<Node> {
        Arc::clone(&*self.node.read().await)
    }

    /// Install a fresh node and return the old one.
    pub async fn replace_node(&self) -> Result<Arc<Node>> {
        let fresh = Arc::new(Node::new(&self.config)?);
        Ok(std::mem::replace(&mut *self.node.write().await, fresh))
    }
}

/// Response envelope for successful API responses.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ApiMeta,
}

/// Response envelope for error API responses.
#[derive(Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
    pub meta: ApiMeta,
}

#[derive(Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiMeta {
    pub request_id: String,
}

impl ApiMeta {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            meta: ApiMeta::new(),
        }
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
            },
            meta: ApiMeta::new(),
        }
    }
}

pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ApiError::new(code, message))).into_response()
}

pub fn ok_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::new(data))).into_response()
}

pub fn invalid_request(message: impl Into<String>) -> Response {
    error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
}

pub fn internal_error(e: &anyhow::Error) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{e:#}"))
}

/// Map a VM error kind to its status and code.
pub fn vm_error_response(e: VmError) -> Response {
    match e {
        VmError::NotFound(_) => {
            error_response(StatusCode::NOT_FOUND, "vm_not_found", e.to_string())
        }
        VmError::AlreadyRegistered(_) => {
            error_response(StatusCode::CONFLICT, "vm_exists", e.to_string())
        }
        VmError::Canceled => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "canceled", e.to_string())
        }
        VmError::Channel(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        }
        VmError::Other(inner) => internal_error(&inner),
    }
}

/// Unwrap a JSON body, answering malformed input with `invalid_request`.
pub(crate) fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| invalid_request(rejection.body_text()))
}

/// Build the full axum Router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(vm::routes())
        .merge(network::routes())
        .merge(node::routes())
        .merge(filesystem::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let vms = state.vms().await;
    ok_response(serde_json::json!({
        "status": "healthy",
        "vms": vms.vm_count().await,
        "jobs": vms.active_jobs().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::util::write_script;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    pub(crate) fn test_state(dir: &std::path::Path) -> Arc<AppState> {
        let mut config = Config::default();
        config.vm.run_dir = dir.join("run");
        config.logs.test_dir = dir.join("vm-test");
        config.logs.vm_log_dir = dir.join("vm-logs");
        config.logs.syscalls_dir = dir.join("vm-syscalls");
        config.logs.node_dir = dir.join("node-logs");
        config.logs.temp_dir = dir.join("tmp");
        config.tracer = TracerConfig {
            script: write_script(dir, "trace.sh", "exec sleep 30"),
            use_sudo: false,
        };
        Arc::new(AppState::new(config).unwrap())
    }

    pub(crate) async fn post_json(
        router: Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_api_response_serialization() {
        let resp = ApiResponse::new(serde_json::json!({"count": 5}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"request_id\""));
    }

    #[test]
    fn test_api_error_serialization() {
        let err = ApiError::new("vm_not_found", "no VM registered with IP 10.0.0.2");
        let json: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["code"], "vm_not_found");
        assert!(json["meta"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_health_reports_vm_count() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path()));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data"]["status"], "healthy");
        assert_eq!(json["data"]["vms"], 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path()));

        let (status, json) = post_json(router, "/vm/command", serde_json::json!({"ip": 5})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_request");
    }
}
