//! 连接注册表
//!
//! 组合本地连接表与分布式在线状态存储：
//! - 本地表保证进程内每个用户一个活跃连接
//! - 在线状态存储是跨实例查询的唯一依据

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use flare_im_core::metrics::AccessGatewayMetrics;
use flare_signaling_online::{Connection, PresenceError, PresenceService, PresenceStore};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::domain::GatewayError;
use crate::infrastructure::{ConnectionHandle, ConnectionTable};

pub struct ConnectionRegistry {
    table: ConnectionTable,
    presence: Arc<PresenceService>,
    store: Arc<dyn PresenceStore>,
    metrics: Arc<AccessGatewayMetrics>,
    reject_on_presence_failure: bool,
}

impl ConnectionRegistry {
    pub fn new(
        presence: Arc<PresenceService>,
        metrics: Arc<AccessGatewayMetrics>,
        reject_on_presence_failure: bool,
    ) -> Self {
        Self {
            table: ConnectionTable::new(),
            store: presence.store(),
            presence,
            metrics,
            reject_on_presence_failure,
        }
    }

    /// 登记新连接
    ///
    /// 在线记录写入失败时重试一次；仍失败则按配置拒绝，
    /// 或放行并标记为在线状态不一致。
    pub async fn connect(
        &self,
        connection: &Connection,
        handle: ConnectionHandle,
    ) -> Result<(), GatewayError> {
        if let Err(err) = self.register_with_retry(connection).await {
            self.metrics
                .presence_store_failure_total
                .with_label_values(&["register"])
                .inc();
            if self.reject_on_presence_failure {
                warn!(
                    user_id = connection.user_id,
                    conn_id = %connection.conn_id,
                    error = %err,
                    "presence registration failed, rejecting connection"
                );
                return Err(err.into());
            }
            warn!(
                user_id = connection.user_id,
                conn_id = %connection.conn_id,
                error = %err,
                presence_inconsistent = true,
                "presence registration failed, connection accepted without distributed record"
            );
        }

        if let Some(evicted) = self.table.add(connection.user_id, handle) {
            info!(
                user_id = connection.user_id,
                evicted_conn_id = %evicted.conn_id,
                conn_id = %connection.conn_id,
                "replacing previous local connection"
            );
            if evicted.is_closed() {
                debug!(conn_id = %evicted.conn_id, "evicted session already gone");
            }
            evicted.evict();
        }

        self.metrics.connections_total.inc();
        self.metrics.connections_active.set(self.table.len() as i64);
        info!(
            user_id = connection.user_id,
            conn_id = %connection.conn_id,
            client_type = %connection.client_type,
            remote_ip = %connection.remote_ip,
            "connection registered"
        );
        Ok(())
    }

    async fn register_with_retry(&self, connection: &Connection) -> Result<(), PresenceError> {
        match self.store.register(connection).await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(
                    conn_id = %connection.conn_id,
                    error = %err,
                    "presence registration failed, retrying once"
                );
                self.store.register(connection).await
            }
        }
    }

    /// 刷新心跳并续期在线记录
    pub async fn heartbeat(&self, user_id: i64, conn_id: &str) -> Result<(), PresenceError> {
        self.store
            .heartbeat(user_id, conn_id, Utc::now())
            .await
            .inspect_err(|err| {
                self.metrics
                    .presence_store_failure_total
                    .with_label_values(&["heartbeat"])
                    .inc();
                warn!(user_id, conn_id = %conn_id, error = %err, "heartbeat refresh failed");
            })
    }

    /// 注销连接：本地表仅移除属于该连接的句柄，在线记录按 conn_id 删除
    pub async fn disconnect(&self, user_id: i64, conn_id: &str) {
        let removed_local = self.table.remove(user_id, conn_id).is_some();

        if let Err(err) = self.store.unregister(user_id, conn_id).await {
            self.metrics
                .presence_store_failure_total
                .with_label_values(&["unregister"])
                .inc();
            warn!(
                user_id,
                conn_id = %conn_id,
                error = %err,
                "presence unregister failed, record will expire by ttl"
            );
        }

        self.metrics.connection_disconnected_total.inc();
        self.metrics.connections_active.set(self.table.len() as i64);
        info!(user_id, conn_id = %conn_id, removed_local, "connection unregistered");
    }

    pub async fn online_status(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, bool>, PresenceError> {
        self.presence.online_status(user_ids).await
    }

    pub fn local(&self, user_id: i64) -> Option<ConnectionHandle> {
        self.table.get(user_id)
    }

    pub fn local_connections(&self) -> usize {
        self.table.len()
    }

    /// 进程退出前清空本地表：通知所有会话退出并删除其在线记录
    ///
    /// 会话随后的注销是幂等的。
    pub async fn shutdown(&self) {
        let drained = self.table.drain();
        let total = drained.len();
        let unregisters = drained.into_iter().map(|(user_id, handle)| async move {
            handle.evict();
            if let Err(err) = self.store.unregister(user_id, &handle.conn_id).await {
                self.metrics
                    .presence_store_failure_total
                    .with_label_values(&["unregister"])
                    .inc();
                warn!(
                    user_id,
                    conn_id = %handle.conn_id,
                    error = %err,
                    "presence unregister failed during shutdown, record will expire by ttl"
                );
            }
        });
        join_all(unregisters).await;

        self.metrics.connections_active.set(0);
        info!(connections = total, "local connections drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use chrono::DateTime;
    use flare_signaling_online::{ClientType, InMemoryPresenceStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connection(user_id: i64, conn_id: &str) -> Connection {
        Connection::new(user_id, conn_id, "gw-test", "t", ClientType::Web, "127.0.0.1")
    }

    fn handle(conn_id: &str) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        (ConnectionHandle::new(conn_id, tx), rx)
    }

    fn registry_with(store: Arc<dyn PresenceStore>, reject: bool) -> ConnectionRegistry {
        ConnectionRegistry::new(
            Arc::new(PresenceService::new(store)),
            Arc::new(AccessGatewayMetrics::new()),
            reject,
        )
    }

    /// 前 `failures` 次 register 失败的存储
    struct FlakyStore {
        failures: usize,
        register_calls: AtomicUsize,
        inner: InMemoryPresenceStore,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                register_calls: AtomicUsize::new(0),
                inner: InMemoryPresenceStore::new(Duration::from_secs(30)),
            }
        }
    }

    #[async_trait]
    impl PresenceStore for FlakyStore {
        async fn register(&self, connection: &Connection) -> Result<(), PresenceError> {
            let call = self.register_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PresenceError::Unavailable("flaky".into()));
            }
            self.inner.register(connection).await
        }

        async fn heartbeat(
            &self,
            user_id: i64,
            conn_id: &str,
            at: DateTime<Utc>,
        ) -> Result<(), PresenceError> {
            self.inner.heartbeat(user_id, conn_id, at).await
        }

        async fn unregister(&self, user_id: i64, conn_id: &str) -> Result<(), PresenceError> {
            self.inner.unregister(user_id, conn_id).await
        }

        async fn is_online(&self, user_ids: &[i64]) -> Result<HashMap<i64, bool>, PresenceError> {
            self.inner.is_online(user_ids).await
        }
    }

    #[tokio::test]
    async fn connect_writes_local_handle_and_record() {
        let store = Arc::new(InMemoryPresenceStore::new(Duration::from_secs(30)));
        let registry = registry_with(store.clone(), false);
        let (h, _rx) = handle("42_1");

        registry.connect(&connection(42, "42_1"), h).await.unwrap();

        assert_eq!(registry.local(42).unwrap().conn_id, "42_1");
        assert_eq!(store.connections(42).await.len(), 1);
        assert_eq!(registry.online_status(&[42]).await.unwrap()[&42], true);
    }

    #[tokio::test]
    async fn registration_is_retried_once() {
        let store = Arc::new(FlakyStore::new(1));
        let registry = registry_with(store.clone(), true);
        let (h, _rx) = handle("42_1");

        registry.connect(&connection(42, "42_1"), h).await.unwrap();

        assert_eq!(store.register_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.inner.connections(42).await.len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_proceeds_by_default() {
        let store = Arc::new(FlakyStore::new(usize::MAX));
        let registry = registry_with(store.clone(), false);
        let (h, _rx) = handle("42_1");

        registry.connect(&connection(42, "42_1"), h).await.unwrap();

        assert_eq!(store.register_calls.load(Ordering::SeqCst), 2);
        assert!(registry.local(42).is_some());
        assert!(store.inner.connections(42).await.is_empty());
    }

    #[tokio::test]
    async fn persistent_failure_rejects_when_configured() {
        let store = Arc::new(FlakyStore::new(usize::MAX));
        let registry = registry_with(store, true);
        let (h, _rx) = handle("42_1");

        let err = registry.connect(&connection(42, "42_1"), h).await.unwrap_err();

        assert!(matches!(err, GatewayError::Presence(PresenceError::Unavailable(_))));
        assert!(registry.local(42).is_none());
    }

    #[tokio::test]
    async fn newer_connection_evicts_older_session() {
        let store = Arc::new(InMemoryPresenceStore::new(Duration::from_secs(30)));
        let registry = registry_with(store.clone(), false);
        let (old, mut old_rx) = handle("42_1");
        let (new, _new_rx) = handle("42_2");

        registry.connect(&connection(42, "42_1"), old).await.unwrap();
        registry.connect(&connection(42, "42_2"), new).await.unwrap();

        assert!(matches!(old_rx.recv().await, Some(Message::Close(None))));
        assert_eq!(registry.local(42).unwrap().conn_id, "42_2");

        // 旧会话退出时的清理不影响新连接
        registry.disconnect(42, "42_1").await;
        assert_eq!(registry.local(42).unwrap().conn_id, "42_2");
        let remaining = store.connections(42).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].conn_id, "42_2");
    }

    #[tokio::test]
    async fn eviction_reaches_session_with_full_queue() {
        let store = Arc::new(InMemoryPresenceStore::new(Duration::from_secs(30)));
        let registry = registry_with(store, false);
        let (tx, _old_rx) = mpsc::channel(1);
        let old = ConnectionHandle::new("42_1", tx);
        let eviction = old.eviction();
        assert!(old.try_send(Message::Ping(Default::default())));
        let (new, _new_rx) = handle("42_2");

        registry.connect(&connection(42, "42_1"), old).await.unwrap();
        registry.connect(&connection(42, "42_2"), new).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), eviction.notified())
            .await
            .expect("evicted session was not signalled");
    }

    #[tokio::test]
    async fn shutdown_unregisters_every_local_connection() {
        let store = Arc::new(InMemoryPresenceStore::new(Duration::from_secs(30)));
        let registry = registry_with(store.clone(), false);
        let (a, _rx1) = handle("1_1");
        let (b, _rx2) = handle("2_1");
        let eviction = a.eviction();
        registry.connect(&connection(1, "1_1"), a).await.unwrap();
        registry.connect(&connection(2, "2_1"), b).await.unwrap();

        registry.shutdown().await;

        assert_eq!(registry.local_connections(), 0);
        let status = registry.online_status(&[1, 2]).await.unwrap();
        assert!(!status[&1] && !status[&2]);
        tokio::time::timeout(Duration::from_secs(1), eviction.notified())
            .await
            .expect("session was not signalled");

        // 会话随后的注销不报错
        registry.disconnect(1, "1_1").await;
        assert!(store.connections(1).await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_removes_both_sides() {
        let store = Arc::new(InMemoryPresenceStore::new(Duration::from_secs(30)));
        let registry = registry_with(store.clone(), false);
        let (h, _rx) = handle("42_1");
        registry.connect(&connection(42, "42_1"), h).await.unwrap();

        registry.disconnect(42, "42_1").await;

        assert_eq!(registry.local_connections(), 0);
        assert_eq!(registry.online_status(&[42]).await.unwrap()[&42], false);
    }
}
