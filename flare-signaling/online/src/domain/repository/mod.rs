use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flare_im_core::error::{ErrorBuilder, ErrorCode, FlareError};
use thiserror::Error;

use crate::domain::model::Connection;

/// 在线状态存储错误
#[derive(Debug, Clone, Error)]
pub enum PresenceError {
    /// 存储整体不可达
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
    /// 单个命令失败
    #[error("presence store command failed: {0}")]
    Storage(String),
    #[error("failed to encode connection record: {0}")]
    Serialization(String),
}

impl From<PresenceError> for FlareError {
    fn from(err: PresenceError) -> Self {
        let code = match &err {
            PresenceError::Unavailable(_) => ErrorCode::ServiceUnavailable,
            PresenceError::Storage(_) => ErrorCode::DatabaseError,
            PresenceError::Serialization(_) => ErrorCode::DeserializationError,
        };
        ErrorBuilder::new(code, "presence store failure")
            .details(err.to_string())
            .build_error()
    }
}

impl From<PresenceError> for tonic::Status {
    fn from(err: PresenceError) -> Self {
        FlareError::from(err).into()
    }
}

/// 分布式在线状态存储
///
/// 记录以心跳超时为 TTL，每次心跳续期；未续期的记录自动过期。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 写入连接记录
    async fn register(&self, connection: &Connection) -> Result<(), PresenceError>;

    /// 刷新心跳并续期
    async fn heartbeat(
        &self,
        user_id: i64,
        conn_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PresenceError>;

    /// 删除连接记录
    async fn unregister(&self, user_id: i64, conn_id: &str) -> Result<(), PresenceError>;

    /// 批量查询在线状态
    ///
    /// 单个用户查询失败按离线处理；仅当存储整体不可达时返回错误。
    async fn is_online(&self, user_ids: &[i64]) -> Result<HashMap<i64, bool>, PresenceError>;
}
