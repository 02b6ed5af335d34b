//! 消息转发
//!
//! 通过服务发现 + 负载均衡选出消息逻辑服务实例，
//! 经连接池获取 gRPC 连接后调用 `flare.message.MessageLogicService`。

use std::sync::Arc;

use async_trait::async_trait;
use flare_im_core::discovery::{LoadBalancer, ServiceDiscovery};
use flare_im_core::grpc::{GrpcClient, GrpcClientManager};
use flare_proto::MessageLogicServiceClient;
use flare_proto::WsMessage;
use flare_proto::flare::message::{ForwardMessageRequest, MarkMessagesReadRequest};
use flare_signaling_online::Connection;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::domain::{GatewayError, MessageForwarder};

pub struct GrpcMessageForwarder {
    discovery: Arc<ServiceDiscovery>,
    balancer: LoadBalancer,
    clients: Arc<GrpcClientManager>,
    service: String,
    gateway_id: String,
    max_retries: u32,
}

impl GrpcMessageForwarder {
    pub fn new(
        discovery: Arc<ServiceDiscovery>,
        balancer: LoadBalancer,
        clients: Arc<GrpcClientManager>,
        service: impl Into<String>,
        gateway_id: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            discovery,
            balancer,
            clients,
            service: service.into(),
            gateway_id: gateway_id.into(),
            max_retries,
        }
    }

    async fn client(&self) -> Result<GrpcClient, GatewayError> {
        let instances = self
            .discovery
            .get_all_service_instances(&self.service)
            .await
            .map_err(|err| GatewayError::Forward(err.to_string()))?;

        // 池中连接指向的实例已下线或不再就绪时，换到本次选出的实例
        let live: Vec<String> = instances
            .iter()
            .filter(|instance| instance.healthy)
            .map(|instance| instance.grpc_endpoint())
            .collect();
        self.clients.evict_unlisted(&self.service, &live);

        let instance = self
            .balancer
            .select(&self.service, &instances)
            .map_err(|err| GatewayError::Forward(err.to_string()))?;

        self.clients
            .get_grpc_client_with_retry(
                &self.service,
                &instance.grpc_endpoint(),
                self.max_retries,
            )
            .await
            .map_err(|err| GatewayError::Forward(err.to_string()))
    }
}

/// 传输层失败时标记连接异常，其余错误说明连接本身可用
fn record_outcome(client: &GrpcClient, status: &Status) {
    if matches!(status.code(), Code::Unavailable | Code::Unknown) {
        client.mark_transient_failure();
    } else {
        client.mark_ready();
    }
}

#[async_trait]
impl MessageForwarder for GrpcMessageForwarder {
    async fn forward(
        &self,
        message: WsMessage,
        connection: &Connection,
    ) -> Result<i64, GatewayError> {
        let client = self.client().await?;
        let mut rpc = MessageLogicServiceClient::new(client.channel());

        let request = ForwardMessageRequest {
            message: Some(message),
            conn_id: connection.conn_id.clone(),
            gateway_id: self.gateway_id.clone(),
        };

        match rpc.forward_message(request).await {
            Ok(response) => {
                client.mark_ready();
                let message_id = response.into_inner().message_id;
                debug!(user_id = connection.user_id, message_id, "message forwarded");
                Ok(message_id)
            }
            Err(status) => {
                record_outcome(&client, &status);
                warn!(
                    user_id = connection.user_id,
                    conn_id = %connection.conn_id,
                    code = ?status.code(),
                    error = %status.message(),
                    "forward message failed"
                );
                Err(GatewayError::Forward(status.to_string()))
            }
        }
    }

    async fn mark_read(&self, user_id: i64, message_ids: Vec<i64>) -> Result<(), GatewayError> {
        let client = self.client().await?;
        let mut rpc = MessageLogicServiceClient::new(client.channel());

        match rpc
            .mark_messages_read(MarkMessagesReadRequest {
                user_id,
                message_ids,
            })
            .await
        {
            Ok(response) => {
                client.mark_ready();
                debug!(user_id, updated = response.into_inner().updated, "messages marked read");
                Ok(())
            }
            Err(status) => {
                record_outcome(&client, &status);
                Err(GatewayError::Forward(status.to_string()))
            }
        }
    }
}
