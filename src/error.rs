//! Flare IM Core 错误工具模块
//!
//! - 统一对外暴露 `ErrorCode` / `FlareError` 错误类型
//! - 为基础设施层提供便捷的错误构建与 gRPC 状态转换

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// 统一错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 参数错误
    InvalidParameter,
    /// 认证失败
    AuthenticationFailed,
    /// 资源不存在
    NotFound,
    /// 依赖服务不可用
    ServiceUnavailable,
    /// 存储访问失败
    DatabaseError,
    /// 反序列化失败
    DeserializationError,
    /// 配置错误
    ConfigurationError,
    /// 内部错误
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flare 统一错误类型
#[derive(Debug, Clone, Error)]
pub enum FlareError {
    /// 带错误码的业务错误
    #[error("[{code}] {reason}{}", format_details(.details))]
    Localized {
        code: ErrorCode,
        reason: String,
        details: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// 系统错误
    #[error("system error: {0}")]
    System(String),
}

impl FlareError {
    pub fn system(message: impl Into<String>) -> Self {
        FlareError::System(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            FlareError::Localized { code, .. } => *code,
            FlareError::System(_) => ErrorCode::Internal,
        }
    }
}

fn format_details(details: &Option<String>) -> String {
    details
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, FlareError>;

/// 错误构建器
pub struct ErrorBuilder {
    code: ErrorCode,
    reason: String,
    details: Option<String>,
}

impl ErrorBuilder {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            details: None,
        }
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn build_error(self) -> FlareError {
        FlareError::Localized {
            code: self.code,
            reason: self.reason,
            details: self.details,
            timestamp: Utc::now(),
        }
    }
}

/// 将基础设施错误映射为业务错误
pub fn map_infra_error<E: fmt::Display>(err: E, code: ErrorCode, reason: &str) -> FlareError {
    ErrorBuilder::new(code, reason)
        .details(err.to_string())
        .build_error()
}

impl From<FlareError> for tonic::Status {
    fn from(err: FlareError) -> Self {
        let message = err.to_string();
        match err.code() {
            ErrorCode::InvalidParameter => tonic::Status::invalid_argument(message),
            ErrorCode::AuthenticationFailed => tonic::Status::unauthenticated(message),
            ErrorCode::NotFound => tonic::Status::not_found(message),
            ErrorCode::ServiceUnavailable | ErrorCode::DatabaseError => {
                tonic::Status::unavailable(message)
            }
            ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::Internal => tonic::Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_code_and_details() {
        let err = ErrorBuilder::new(ErrorCode::DatabaseError, "failed to read presence")
            .details("connection refused")
            .build_error();
        assert_eq!(err.code(), ErrorCode::DatabaseError);
        assert_eq!(
            err.to_string(),
            "[DATABASE_ERROR] failed to read presence: connection refused"
        );
    }

    #[test]
    fn status_mapping() {
        let status: tonic::Status =
            map_infra_error("boom", ErrorCode::ServiceUnavailable, "redis down").into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status = FlareError::system("oops").into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
