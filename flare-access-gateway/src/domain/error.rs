use flare_signaling_online::PresenceError;
use thiserror::Error;

use super::session::SessionState;

/// 网关错误
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid user id: {0}")]
    InvalidUserId(String),
    #[error("authentication failed for user {0}")]
    AuthenticationFailed(i64),
    #[error("unknown message type: {0}")]
    UnknownMessageType(i32),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("forward to message service failed: {0}")]
    Forward(String),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

impl GatewayError {
    /// 指标标签
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::MissingHeader(_) => "missing_header",
            GatewayError::InvalidUserId(_) => "invalid_user_id",
            GatewayError::AuthenticationFailed(_) => "unauthorized",
            GatewayError::UnknownMessageType(_) => "unknown_message_type",
            GatewayError::InvalidMessage(_) => "invalid_message",
            GatewayError::Forward(_) => "forward",
            GatewayError::Presence(_) => "presence",
            GatewayError::Transport(_) => "transport",
            GatewayError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}
