//! 微服务服务名定义模块
//!
//! 服务发现（Kubernetes Service 名称）与 gRPC 连接池均以这里的常量为键，
//! 注册时使用的服务名必须与发现时使用的服务名完全一致。

/// Flare IM 微服务服务名定义
pub mod service_names {
    /// 接入网关
    pub const ACCESS_GATEWAY: &str = "flare-access-gateway";

    /// Signaling Online 服务名
    ///
    /// 用于在线状态查询
    pub const SIGNALING_ONLINE: &str = "flare-signaling-online";

    /// 消息逻辑服务名
    ///
    /// 网关将聊天文本与 ACK 转发到该服务
    pub const MESSAGE_SERVICE: &str = "flare-message-service";
}

pub use service_names::*;
