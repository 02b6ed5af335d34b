use async_trait::async_trait;
use flare_proto::WsMessage;
use flare_signaling_online::Connection;

use super::GatewayError;

/// 令牌校验
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// 令牌有效且属于 `user_id` 时返回 true
    async fn validate(&self, token: &str, user_id: i64) -> bool;
}

/// 消息逻辑服务
#[async_trait]
pub trait MessageForwarder: Send + Sync {
    /// 转发上行聊天消息，返回服务端确认的消息 ID
    async fn forward(
        &self,
        message: WsMessage,
        connection: &Connection,
    ) -> Result<i64, GatewayError>;

    /// 标记消息已读
    async fn mark_read(&self, user_id: i64, message_ids: Vec<i64>) -> Result<(), GatewayError>;
}
