//! Flare Access Gateway
//!
//! 客户端 WebSocket 接入：
//! - 升级前校验 `Authorization` / `User-ID`
//! - 本地连接表 + 分布式在线状态登记
//! - 二进制 protobuf 帧按类型路由，聊天消息经 gRPC 转发到消息逻辑服务
//! - 在线状态查询、指标与健康检查 HTTP 接口

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod service;

pub use application::{ConnectionRegistry, MessageRouter};
pub use config::AccessGatewayConfig;
pub use domain::{GatewayError, MessageForwarder, SessionState, TokenValidator};
pub use interface::{GatewayState, build_router};
