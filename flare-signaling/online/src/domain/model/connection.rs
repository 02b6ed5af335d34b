use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 客户端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Web,
    Mobile,
    Desktop,
    #[default]
    Unknown,
}

impl ClientType {
    /// 从请求头解析，无法识别时为 Unknown
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "web" | "browser" => ClientType::Web,
            "mobile" | "ios" | "android" => ClientType::Mobile,
            "desktop" | "pc" | "mac" | "windows" | "linux" => ClientType::Desktop,
            _ => ClientType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Web => "web",
            ClientType::Mobile => "mobile",
            ClientType::Desktop => "desktop",
            ClientType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接记录（Connection）
///
/// 职责：表示一个客户端 WebSocket 会话
/// 设计要点：
/// - 同一用户可在多个网关实例上同时拥有连接（多设备）
/// - 单个网关进程内每个用户最多一个活跃连接
/// - `conn_id` 由用户 ID 与升级时生成的 Snowflake ID 组成，全局唯一
/// - 令牌只做校验，不持久化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub user_id: i64,
    pub conn_id: String,
    /// 所属网关实例
    pub instance_id: String,
    #[serde(skip)]
    pub token: String,
    pub client_type: ClientType,
    pub remote_ip: String,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        user_id: i64,
        conn_id: impl Into<String>,
        instance_id: impl Into<String>,
        token: impl Into<String>,
        client_type: ClientType,
        remote_ip: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            conn_id: conn_id.into(),
            instance_id: instance_id.into(),
            token: token.into(),
            client_type,
            remote_ip: remote_ip.into(),
            created_at: now,
            last_heartbeat_at: now,
        }
    }

    /// 生成连接 ID：`{user_id}_{snowflake_id}`
    pub fn compose_conn_id(user_id: i64, snowflake_id: i64) -> String {
        format!("{user_id}_{snowflake_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_type_parsing() {
        assert_eq!(ClientType::parse("Android"), ClientType::Mobile);
        assert_eq!(ClientType::parse(" web "), ClientType::Web);
        assert_eq!(ClientType::parse("desktop"), ClientType::Desktop);
        assert_eq!(ClientType::parse("toaster"), ClientType::Unknown);
    }

    #[test]
    fn token_is_not_serialized() {
        let conn = Connection::new(42, "42_1", "gw-1", "secret", ClientType::Web, "10.0.0.1");
        let json = serde_json::to_string(&conn).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"client_type\":\"web\""));

        let decoded: Connection = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.conn_id, "42_1");
        assert!(decoded.token.is_empty());
    }
}
