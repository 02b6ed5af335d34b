//! 接入网关服务
//!
//! 客户端长连接的统一入口。
//!
//! ## 职责
//!
//! 1. **连接接入与认证**
//!    - WebSocket 升级前校验 `Authorization` 与 `User-ID` 请求头
//!    - 令牌无效直接返回 401，不建立连接
//!
//! 2. **在线状态**
//!    - 本地连接表：每个用户在本实例最多一个活跃连接，新连接替换旧连接
//!    - 分布式在线记录：以心跳超时为 TTL，心跳续期，断开时删除
//!    - 同一用户可在多个网关实例上同时在线（多设备）
//!
//! 3. **心跳检测**
//!    - ping 帧与应用层心跳帧均刷新在线记录
//!    - 超过心跳超时未收到任何帧时主动断开
//!
//! 4. **消息路由**
//!    - 二进制 protobuf 帧按消息类型分发
//!    - 聊天消息分配 Snowflake ID 后经 gRPC 转发到消息逻辑服务
//!    - 已读确认委托消息逻辑服务处理
//!
//! ## 部署
//!
//! 每个副本需配置唯一的 `machine_id`（0-1023），保证消息 ID 全局唯一。

use flare_access_gateway::service::ApplicationBootstrap;
use flare_im_core::{load_config, tracing::init_tracing_from_config};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = load_config(Some("config"));
    init_tracing_from_config(Some(&app_config.logging));

    info!("🚀 启动接入网关服务");
    info!("");
    info!("📋 服务说明：");
    info!("   - WebSocket 长连接：认证、心跳、消息收发");
    info!("   - HTTP 接口：在线状态查询、指标、健康检查");
    info!("   - 在线状态写入分布式存储，支持多实例部署");
    info!("");

    ApplicationBootstrap::run(app_config).await
}
