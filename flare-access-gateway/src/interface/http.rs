//! HTTP 接口
//!
//! - `GET {ws_path}`：WebSocket 升级
//! - `POST /api/v1/online-status`：批量在线状态查询
//! - `GET /metrics`：Prometheus 指标
//! - `GET /healthz`：网关与 gRPC 连接池健康状态

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flare_im_core::metrics::gather_metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::domain::GatewayError;
use crate::interface::GatewayState;
use crate::interface::websocket::ws_handler;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::MissingHeader(_)
            | GatewayError::InvalidUserId(_)
            | GatewayError::InvalidMessage(_)
            | GatewayError::UnknownMessageType(_) => StatusCode::BAD_REQUEST,
            GatewayError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Presence(_) | GatewayError::Forward(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport(_) | GatewayError::InvalidTransition { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "error": self.to_string(),
            "reason": self.reason(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct OnlineStatusRequest {
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct OnlineStatusResponse {
    pub status: HashMap<i64, bool>,
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    let ws_path = state.config.ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/api/v1/online-status", post(online_status))
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn online_status(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<OnlineStatusRequest>,
) -> Result<Json<OnlineStatusResponse>, GatewayError> {
    match state.registry.online_status(&request.user_ids).await {
        Ok(status) => Ok(Json(OnlineStatusResponse { status })),
        Err(err) => {
            state
                .metrics
                .presence_store_failure_total
                .with_label_values(&["is_online"])
                .inc();
            warn!(users = request.user_ids.len(), error = %err, "online status query failed");
            Err(err.into())
        }
    }
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

async fn healthz(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let grpc = state.grpc_clients.health_check();
    let status = if grpc.values().all(|healthy| *healthy) {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "gateway_id": state.config.gateway_id,
        "connections": state.registry.local_connections(),
        "grpc": grpc,
    }))
}
