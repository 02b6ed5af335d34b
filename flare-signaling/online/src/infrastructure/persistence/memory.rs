//! 内存在线状态存储
//!
//! 未配置 Redis 时使用，也用于测试。只对当前进程可见。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::domain::model::Connection;
use crate::domain::repository::{PresenceError, PresenceStore};

#[derive(Debug, Clone)]
struct Entry {
    connection: Connection,
    expires_at: Instant,
}

/// 内存在线状态存储
pub struct InMemoryPresenceStore {
    ttl: Duration,
    users: RwLock<HashMap<i64, HashMap<String, Entry>>>,
}

impl InMemoryPresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// 用户当前未过期的连接
    pub async fn connections(&self, user_id: i64) -> Vec<Connection> {
        let now = Instant::now();
        self.users
            .read()
            .await
            .get(&user_id)
            .map(|conns| {
                conns
                    .values()
                    .filter(|e| e.expires_at > now)
                    .map(|e| e.connection.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn register(&self, connection: &Connection) -> Result<(), PresenceError> {
        let now = Instant::now();
        let mut users = self.users.write().await;
        let conns = users.entry(connection.user_id).or_default();
        conns.retain(|_, e| e.expires_at > now);
        conns.insert(
            connection.conn_id.clone(),
            Entry {
                connection: connection.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn heartbeat(
        &self,
        user_id: i64,
        conn_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PresenceError> {
        let now = Instant::now();
        let mut users = self.users.write().await;
        if let Some(entry) = users.get_mut(&user_id).and_then(|c| c.get_mut(conn_id)) {
            entry.connection.last_heartbeat_at = at;
            entry.expires_at = now + self.ttl;
        }
        Ok(())
    }

    async fn unregister(&self, user_id: i64, conn_id: &str) -> Result<(), PresenceError> {
        let mut users = self.users.write().await;
        if let Some(conns) = users.get_mut(&user_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                users.remove(&user_id);
            }
        }
        Ok(())
    }

    async fn is_online(&self, user_ids: &[i64]) -> Result<HashMap<i64, bool>, PresenceError> {
        let now = Instant::now();
        let users = self.users.read().await;
        Ok(user_ids
            .iter()
            .map(|id| {
                let online = users
                    .get(id)
                    .is_some_and(|conns| conns.values().any(|e| e.expires_at > now));
                (*id, online)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ClientType;

    fn connection(user_id: i64, conn_id: &str, instance: &str) -> Connection {
        Connection::new(user_id, conn_id, instance, "t", ClientType::Mobile, "10.0.0.1")
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_record_alive_until_silence() {
        let ttl = Duration::from_secs(30);
        let store = InMemoryPresenceStore::new(ttl);
        store.register(&connection(7, "7_1", "gw-a")).await.unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(20)).await;
            store.heartbeat(7, "7_1", Utc::now()).await.unwrap();
            assert_eq!(store.is_online(&[7]).await.unwrap()[&7], true);
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.is_online(&[7]).await.unwrap()[&7], false);
        assert!(store.connections(7).await.is_empty());
    }

    #[tokio::test]
    async fn multi_device_records_are_independent() {
        let store = InMemoryPresenceStore::new(Duration::from_secs(30));
        store.register(&connection(9, "9_1", "gw-a")).await.unwrap();
        store.register(&connection(9, "9_2", "gw-b")).await.unwrap();
        assert_eq!(store.connections(9).await.len(), 2);

        store.unregister(9, "9_1").await.unwrap();
        assert_eq!(store.is_online(&[9]).await.unwrap()[&9], true);

        store.unregister(9, "9_2").await.unwrap();
        assert_eq!(store.is_online(&[9]).await.unwrap()[&9], false);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_connection_is_ignored() {
        let store = InMemoryPresenceStore::new(Duration::from_secs(30));
        store.heartbeat(1, "1_1", Utc::now()).await.unwrap();
        assert_eq!(store.is_online(&[1]).await.unwrap()[&1], false);
    }
}
