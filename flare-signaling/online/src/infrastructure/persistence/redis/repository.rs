use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flare_im_core::config::RedisPoolConfig;
use futures::future::join_all;
use redis::{AsyncCommands, RedisError, Script, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::domain::model::Connection;
use crate::domain::repository::{PresenceError, PresenceStore};

const DEFAULT_NAMESPACE: &str = "flare";

/// 仅当连接记录仍存在时续期
///
/// KEYS[1] 用户有序集合，KEYS[2] 连接记录；ARGV: conn_id, 过期分值, ttl 毫秒。
/// 注销之后迟到的心跳返回 0，不会重新写入有序集合。
const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('PEXPIRE', KEYS[2], ARGV[3])
return 1
"#;

/// Redis 在线状态存储
///
/// 数据布局：
/// - `{ns}:presence:user:{user_id}`：有序集合，成员为 conn_id，分值为过期时间（毫秒）
/// - `{ns}:presence:conn:{conn_id}`：连接记录 JSON，带 TTL
///
/// 用户是否在线 = 有序集合中存在分值大于当前时间的成员，
/// 因此单个设备过期不依赖整个 key 过期。
pub struct RedisPresenceStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    namespace: String,
    ttl: Duration,
    heartbeat_script: Script,
}

impl RedisPresenceStore {
    pub fn new(config: &RedisPoolConfig, ttl: Duration) -> Result<Self, PresenceError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| PresenceError::Unavailable(format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            namespace: config
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            ttl,
            heartbeat_script: Script::new(HEARTBEAT_SCRIPT),
        })
    }

    fn user_key(&self, user_id: i64) -> String {
        format!("{}:presence:user:{}", self.namespace, user_id)
    }

    fn conn_key(&self, conn_id: &str) -> String {
        format!("{}:presence:conn:{}", self.namespace, conn_id)
    }

    fn ttl_millis(&self) -> i64 {
        self.ttl.as_millis() as i64
    }

    /// 懒建立连接，ConnectionManager 断线后自动重连
    async fn connection(&self) -> Result<ConnectionManager, PresenceError> {
        self.manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
            .map_err(|err| PresenceError::Unavailable(err.to_string()))
    }
}

/// 有序集合分值：该连接的过期时刻（毫秒）
fn expiry_score(at_ms: i64, ttl_ms: i64) -> i64 {
    at_ms + ttl_ms
}

/// ZCOUNT 的开区间下界，分值等于当前时刻的连接视为已过期
fn online_lower_bound(now_ms: i64) -> String {
    format!("({now_ms}")
}

/// 汇总逐用户查询结果
///
/// 单个用户查询失败时记为离线；全部因 Redis 不可达而失败时整体报错。
fn collect_online_status(
    results: Vec<(i64, Result<usize, RedisError>)>,
) -> Result<HashMap<i64, bool>, PresenceError> {
    let total = results.len();
    let mut status = HashMap::with_capacity(total);
    let mut unreachable = 0usize;
    let mut last_error = None;
    for (user_id, result) in results {
        match result {
            Ok(count) => {
                status.insert(user_id, count > 0);
            }
            Err(err) => {
                warn!(user_id, error = %err, "presence lookup failed, treating as offline");
                if is_unreachable(&err) {
                    unreachable += 1;
                }
                last_error = Some(err.to_string());
                status.insert(user_id, false);
            }
        }
    }

    if total > 0 && unreachable == total {
        return Err(PresenceError::Unavailable(
            last_error.unwrap_or_else(|| "all lookups failed".to_string()),
        ));
    }

    Ok(status)
}

fn is_unreachable(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

fn command_error(err: RedisError) -> PresenceError {
    if is_unreachable(&err) {
        PresenceError::Unavailable(err.to_string())
    } else {
        PresenceError::Storage(err.to_string())
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn register(&self, connection: &Connection) -> Result<(), PresenceError> {
        let mut conn = self.connection().await?;
        let user_key = self.user_key(connection.user_id);
        let conn_key = self.conn_key(&connection.conn_id);
        let now = Utc::now().timestamp_millis();
        let ttl_ms = self.ttl_millis();

        let payload = serde_json::to_string(connection)
            .map_err(|err| PresenceError::Serialization(err.to_string()))?;

        let _: () = redis::pipe()
            .atomic()
            .zrembyscore(&user_key, "-inf", now)
            .ignore()
            .zadd(&user_key, &connection.conn_id, expiry_score(now, ttl_ms))
            .ignore()
            .pexpire(&user_key, ttl_ms)
            .ignore()
            .cmd("SET")
            .arg(&conn_key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        debug!(user_id = connection.user_id, conn_id = %connection.conn_id, "presence registered");
        Ok(())
    }

    async fn heartbeat(
        &self,
        user_id: i64,
        conn_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PresenceError> {
        let mut conn = self.connection().await?;
        let user_key = self.user_key(user_id);
        let conn_key = self.conn_key(conn_id);
        let ttl_ms = self.ttl_millis();

        // 同一用户各设备的过期时间都不晚于 now + ttl，整体续期不会缩短其他设备
        let refreshed: i64 = self
            .heartbeat_script
            .key(&user_key)
            .key(&conn_key)
            .arg(conn_id)
            .arg(expiry_score(at.timestamp_millis(), ttl_ms))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        if refreshed == 0 {
            debug!(user_id, conn_id = %conn_id, "heartbeat for unknown connection ignored");
        }
        Ok(())
    }

    async fn unregister(&self, user_id: i64, conn_id: &str) -> Result<(), PresenceError> {
        let mut conn = self.connection().await?;
        let user_key = self.user_key(user_id);
        let conn_key = self.conn_key(conn_id);

        let _: () = redis::pipe()
            .atomic()
            .zrem(&user_key, conn_id)
            .ignore()
            .del(&conn_key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        debug!(user_id, conn_id = %conn_id, "presence unregistered");
        Ok(())
    }

    async fn is_online(&self, user_ids: &[i64]) -> Result<HashMap<i64, bool>, PresenceError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.connection().await?;
        let lower_bound = online_lower_bound(Utc::now().timestamp_millis());

        // ConnectionManager 为多路复用连接，并发请求会自动流水线化
        let lookups = user_ids.iter().map(|user_id| {
            let mut conn = conn.clone();
            let key = self.user_key(*user_id);
            let lower_bound = lower_bound.clone();
            async move {
                let result: Result<usize, RedisError> =
                    conn.zcount(&key, lower_bound, "+inf").await;
                (*user_id, result)
            }
        });

        collect_online_status(join_all(lookups).await)
    }
}
