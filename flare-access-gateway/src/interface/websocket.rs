//! WebSocket 升级入口
//!
//! 升级前完成头部校验与令牌校验，失败时直接返回 HTTP 错误，不建立连接。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, AsHeaderName};
use axum::response::{IntoResponse, Response};
use flare_signaling_online::{ClientType, Connection};
use tracing::{info, warn};

use crate::domain::{GatewayError, SessionState};
use crate::interface::GatewayState;
use crate::interface::connection::{advance, run_session};

pub const USER_ID_HEADER: &str = "user-id";
pub const CLIENT_TYPE_HEADER: &str = "client-type";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug)]
struct UpgradeRequest {
    user_id: i64,
    token: String,
    client_type: ClientType,
}

fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_upgrade_headers(headers: &HeaderMap) -> Result<UpgradeRequest, GatewayError> {
    let authorization =
        header_str(headers, AUTHORIZATION).ok_or(GatewayError::MissingHeader("Authorization"))?;
    let token = match authorization.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ if authorization.eq_ignore_ascii_case("bearer") => "",
        _ => authorization,
    };
    if token.is_empty() {
        return Err(GatewayError::MissingHeader("Authorization"));
    }

    let raw_user_id =
        header_str(headers, USER_ID_HEADER).ok_or(GatewayError::MissingHeader("User-ID"))?;
    let user_id = raw_user_id
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| GatewayError::InvalidUserId(raw_user_id.to_string()))?;

    let client_type = header_str(headers, CLIENT_TYPE_HEADER)
        .map(ClientType::parse)
        .unwrap_or_default();

    Ok(UpgradeRequest {
        user_id,
        token: token.to_string(),
        client_type,
    })
}

/// 反向代理之后优先取 X-Forwarded-For 的第一个地址
fn remote_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<UpgradeRequest, GatewayError> {
    let request = parse_upgrade_headers(headers)?;
    if !state.validator.validate(&request.token, request.user_id).await {
        return Err(GatewayError::AuthenticationFailed(request.user_id));
    }
    Ok(request)
}

pub async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let mut session = SessionState::Connecting;

    let request = match authenticate(&state, &headers).await {
        Ok(request) => request,
        Err(err) => {
            advance(&mut session, SessionState::Rejected);
            state
                .metrics
                .connections_rejected_total
                .with_label_values(&[err.reason()])
                .inc();
            warn!(peer = %peer, error = %err, "websocket upgrade rejected");
            return err.into_response();
        }
    };
    advance(&mut session, SessionState::Authenticated);

    let conn_id = Connection::compose_conn_id(request.user_id, state.id_generator.generate());
    let connection = Connection::new(
        request.user_id,
        conn_id,
        state.config.gateway_id.clone(),
        request.token,
        request.client_type,
        remote_ip(&headers, peer),
    );
    info!(
        user_id = connection.user_id,
        conn_id = %connection.conn_id,
        client_type = %connection.client_type,
        "websocket upgrade accepted"
    );

    ws.on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| run_session(socket, state, connection, session))
}
