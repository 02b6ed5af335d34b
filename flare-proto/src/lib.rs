//! Flare IM 协议定义
//!
//! - `flare.gateway`：WebSocket 二进制帧
//! - `flare.online`：在线状态查询 gRPC 服务
//! - `flare.message`：消息逻辑 gRPC 服务

pub mod flare {
    pub mod gateway {
        tonic::include_proto!("flare.gateway");
    }

    pub mod online {
        tonic::include_proto!("flare.online");
    }

    pub mod message {
        tonic::include_proto!("flare.message");
    }
}

pub use flare::gateway::{MessageType, WsMessage};
pub use flare::message::message_logic_service_client::MessageLogicServiceClient;
pub use flare::message::message_logic_service_server::{
    MessageLogicService, MessageLogicServiceServer,
};
pub use flare::online::online_status_service_client::OnlineStatusServiceClient;
pub use flare::online::online_status_service_server::{
    OnlineStatusService, OnlineStatusServiceServer,
};
