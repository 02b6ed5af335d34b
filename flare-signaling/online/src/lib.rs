//! Flare Signaling Online
//!
//! 分布式在线状态：
//! - 连接记录存储（Redis / 内存），按心跳 TTL 自动过期
//! - 批量在线状态查询服务
//! - `flare.online.OnlineStatusService` gRPC 服务端

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod service;

pub use application::PresenceService;
pub use config::OnlineConfig;
pub use domain::model::{ClientType, Connection};
pub use domain::repository::{PresenceError, PresenceStore};
pub use infrastructure::persistence::{InMemoryPresenceStore, RedisPresenceStore, build_presence_store};
