//! 消息路由
//!
//! 按帧类型分发，不在消息之间保留状态。返回值为需要回写给客户端的帧。

use std::sync::Arc;

use flare_im_core::id::SnowflakeGenerator;
use flare_im_core::utils::current_millis;
use flare_proto::{MessageType, WsMessage};
use flare_signaling_online::Connection;
use tracing::{debug, info};

use crate::application::ConnectionRegistry;
use crate::domain::{GatewayError, MessageForwarder};

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    forwarder: Arc<dyn MessageForwarder>,
    id_generator: Arc<SnowflakeGenerator>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        forwarder: Arc<dyn MessageForwarder>,
        id_generator: Arc<SnowflakeGenerator>,
    ) -> Self {
        Self {
            registry,
            forwarder,
            id_generator,
        }
    }

    pub async fn route(
        &self,
        message: WsMessage,
        connection: &Connection,
    ) -> Result<Option<WsMessage>, GatewayError> {
        let message_type = MessageType::try_from(message.message_type)
            .map_err(|_| GatewayError::UnknownMessageType(message.message_type))?;

        match message_type {
            MessageType::Text => self.route_text(message, connection).await.map(|_| None),
            MessageType::Heartbeat => Ok(Some(self.route_heartbeat(&message, connection).await)),
            MessageType::ConnectionManage => {
                info!(
                    user_id = connection.user_id,
                    conn_id = %connection.conn_id,
                    content_len = message.content.len(),
                    "connection manage frame received"
                );
                Ok(None)
            }
            MessageType::Ack => self.route_ack(&message, connection).await.map(|_| None),
            MessageType::PresenceEvent => {
                debug!(
                    user_id = connection.user_id,
                    conn_id = %connection.conn_id,
                    "presence event frame received"
                );
                Ok(None)
            }
            MessageType::Unspecified => {
                Err(GatewayError::UnknownMessageType(message.message_type))
            }
        }
    }

    async fn route_text(
        &self,
        mut message: WsMessage,
        connection: &Connection,
    ) -> Result<i64, GatewayError> {
        if message.to == 0 && message.group_id == 0 {
            return Err(GatewayError::InvalidMessage(
                "text message requires a recipient or group".to_string(),
            ));
        }

        // 发送方以连接身份为准
        message.from = connection.user_id;
        if message.message_id == 0 {
            message.message_id = self.id_generator.generate();
        }
        if message.timestamp == 0 {
            message.timestamp = current_millis();
        }

        let message_id = message.message_id;
        let confirmed = self.forwarder.forward(message, connection).await?;
        debug!(
            user_id = connection.user_id,
            message_id,
            confirmed,
            "text message routed"
        );
        Ok(confirmed)
    }

    async fn route_heartbeat(&self, message: &WsMessage, connection: &Connection) -> WsMessage {
        // 存储失败已在注册表中记录，心跳仍然应答
        let _ = self
            .registry
            .heartbeat(connection.user_id, &connection.conn_id)
            .await;

        WsMessage {
            message_type: MessageType::Heartbeat as i32,
            to: connection.user_id,
            ack_id: message.message_id,
            timestamp: current_millis(),
            ..Default::default()
        }
    }

    async fn route_ack(
        &self,
        message: &WsMessage,
        connection: &Connection,
    ) -> Result<(), GatewayError> {
        let acked = if message.ack_id != 0 {
            message.ack_id
        } else {
            message.message_id
        };
        if acked == 0 {
            return Err(GatewayError::InvalidMessage(
                "ack frame without message id".to_string(),
            ));
        }

        self.forwarder.mark_read(connection.user_id, vec![acked]).await
    }
}
