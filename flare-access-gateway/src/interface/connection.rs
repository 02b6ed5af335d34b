//! 长连接会话
//!
//! 每个连接一个读循环任务与一个写任务：
//! - 读循环顺序处理入站帧，解码失败的帧丢弃后继续
//! - 写任务独占 socket 发送端，由有界队列供给
//! - 被新连接替换时经独立信号退出，不依赖出站队列
//! - 客户端 Ping 由 WebSocket 协议栈自动回 Pong，这里只刷新心跳
//! - 会话退出（包括任务被取消）时由清理守卫注销连接，且只注销一次

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use flare_proto::{MessageType, WsMessage};
use flare_signaling_online::Connection;
use futures::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::ConnectionRegistry;
use crate::domain::{GatewayError, SessionState};
use crate::infrastructure::ConnectionHandle;
use crate::interface::GatewayState;

/// 会话结束后等待写任务把剩余帧写完的时间
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn advance(session: &mut SessionState, next: SessionState) {
    if let Err(err) = session.transition(next) {
        error!(error = %err, "unexpected session state transition");
    }
}

/// 注销守卫
///
/// 正常路径调用 `finish`；若会话任务在此之前被取消，Drop 时补做注销。
struct CleanupGuard {
    registry: Option<Arc<ConnectionRegistry>>,
    user_id: i64,
    conn_id: String,
}

impl CleanupGuard {
    fn new(registry: Arc<ConnectionRegistry>, user_id: i64, conn_id: String) -> Self {
        Self {
            registry: Some(registry),
            user_id,
            conn_id,
        }
    }

    async fn finish(mut self) {
        if let Some(registry) = self.registry.take() {
            registry.disconnect(self.user_id, &self.conn_id).await;
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };
        let user_id = self.user_id;
        let conn_id = std::mem::take(&mut self.conn_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(user_id, conn_id = %conn_id, "session aborted, cleaning up in background");
                runtime.spawn(async move {
                    registry.disconnect(user_id, &conn_id).await;
                });
            }
            Err(_) => {
                error!(
                    user_id,
                    conn_id = %conn_id,
                    "no runtime to clean up aborted session, record will expire by ttl"
                );
            }
        }
    }
}

fn message_type_label(raw: i32) -> &'static str {
    MessageType::try_from(raw)
        .map(|t| t.as_str_name())
        .unwrap_or("UNKNOWN")
}

fn encode_frame(message: &WsMessage) -> Message {
    Message::Binary(Bytes::from(message.encode_to_vec()))
}

/// 运行已升级的会话，直到客户端断开、读写出错或心跳超时
pub async fn run_session(
    socket: WebSocket,
    state: Arc<GatewayState>,
    connection: Connection,
    mut session: SessionState,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.outbound_buffer);

    let handle = ConnectionHandle::new(connection.conn_id.clone(), tx.clone());
    let eviction = handle.eviction();
    if let Err(err) = state.registry.connect(&connection, handle).await {
        advance(&mut session, SessionState::Closing);
        state
            .metrics
            .connections_rejected_total
            .with_label_values(&[err.reason()])
            .inc();
        let frame = CloseFrame {
            code: close_code::ERROR,
            reason: Utf8Bytes::from_static("presence store unavailable"),
        };
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "failed to send close frame");
        }
        advance(&mut session, SessionState::Closed);
        return;
    }
    advance(&mut session, SessionState::Active);
    let guard = CleanupGuard::new(
        state.registry.clone(),
        connection.user_id,
        connection.conn_id.clone(),
    );

    let mut writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                debug!(error = %err, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let mut writer_done = false;

    let idle_timeout = state.config.heartbeat_timeout;
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
            _ = &mut writer => {
                writer_done = true;
                debug!(conn_id = %connection.conn_id, "writer finished, closing session");
                break;
            }
            _ = eviction.notified() => {
                info!(
                    user_id = connection.user_id,
                    conn_id = %connection.conn_id,
                    "session evicted, closing"
                );
                break;
            }
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                warn!(conn_id = %connection.conn_id, error = %err, "websocket read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(
                    user_id = connection.user_id,
                    conn_id = %connection.conn_id,
                    timeout_secs = idle_timeout.as_secs(),
                    "heartbeat timeout, closing session"
                );
                let _ = tx.try_send(Message::Close(None));
                break;
            }
        };

        match message {
            Message::Binary(data) => handle_frame(&state, &connection, &tx, data).await,
            Message::Ping(_) => {
                let registry = state.registry.clone();
                let user_id = connection.user_id;
                let conn_id = connection.conn_id.clone();
                tokio::spawn(async move {
                    let _ = registry.heartbeat(user_id, &conn_id).await;
                });
            }
            Message::Pong(_) => {}
            Message::Text(_) => {
                state.metrics.malformed_frames_total.inc();
                warn!(
                    conn_id = %connection.conn_id,
                    "dropping text frame, binary protobuf expected"
                );
            }
            Message::Close(frame) => {
                debug!(conn_id = %connection.conn_id, ?frame, "client closed connection");
                break;
            }
        }
    }

    advance(&mut session, SessionState::Closing);
    guard.finish().await;
    drop(tx);

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    advance(&mut session, SessionState::Closed);
    info!(user_id = connection.user_id, conn_id = %connection.conn_id, "session closed");
}

async fn handle_frame(
    state: &GatewayState,
    connection: &Connection,
    tx: &mpsc::Sender<Message>,
    data: Bytes,
) {
    let message = match WsMessage::decode(data) {
        Ok(message) => message,
        Err(err) => {
            state.metrics.malformed_frames_total.inc();
            warn!(conn_id = %connection.conn_id, error = %err, "dropping malformed frame");
            return;
        }
    };

    state
        .metrics
        .frames_received_total
        .with_label_values(&[message_type_label(message.message_type)])
        .inc();

    match state.router.route(message, connection).await {
        Ok(Some(reply)) => {
            if tx.send(encode_frame(&reply)).await.is_err() {
                debug!(conn_id = %connection.conn_id, "session closed before reply was queued");
            }
        }
        Ok(None) => {}
        Err(err @ GatewayError::Forward(_)) => {
            state.metrics.forward_failure_total.inc();
            warn!(user_id = connection.user_id, error = %err, "message routing failed");
        }
        Err(err) => {
            warn!(user_id = connection.user_id, error = %err, "dropping frame");
        }
    }
}
