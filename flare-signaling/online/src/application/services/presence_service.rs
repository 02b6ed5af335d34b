use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::domain::repository::{PresenceError, PresenceStore};

/// 在线状态查询服务
///
/// WebSocket 侧、网关 HTTP 查询接口与 gRPC 服务共用。
pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
}

impl PresenceService {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn PresenceStore> {
        self.store.clone()
    }

    /// 批量查询在线状态
    ///
    /// 请求去重后一次性查询存储，返回结果覆盖全部请求的用户。
    pub async fn online_status(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, bool>, PresenceError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut seen = HashSet::with_capacity(user_ids.len());
        let unique: Vec<i64> = user_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let mut status = self.store.is_online(&unique).await?;
        for user_id in &unique {
            status.entry(*user_id).or_insert(false);
        }

        debug!(
            requested = user_ids.len(),
            unique = unique.len(),
            online = status.values().filter(|v| **v).count(),
            "online status resolved"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ClientType, Connection};
    use crate::infrastructure::persistence::InMemoryPresenceStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    fn service() -> (PresenceService, Arc<InMemoryPresenceStore>) {
        let store = Arc::new(InMemoryPresenceStore::new(Duration::from_secs(30)));
        (PresenceService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn empty_input_returns_empty_map() {
        let (service, _) = service();
        assert!(service.online_status(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_user_is_offline() {
        let (service, _) = service();
        let status = service.online_status(&[42]).await.unwrap();
        assert_eq!(status, HashMap::from([(42, false)]));
    }

    #[tokio::test]
    async fn multi_device_across_instances() {
        let (service, store) = service();
        let on_a = Connection::new(5, "5_100", "gw-a", "t", ClientType::Web, "10.0.0.1");
        let on_b = Connection::new(5, "5_200", "gw-b", "t", ClientType::Mobile, "10.0.0.2");
        store.register(&on_a).await.unwrap();
        store.register(&on_b).await.unwrap();

        store.unregister(5, "5_100").await.unwrap();
        assert_eq!(service.online_status(&[5]).await.unwrap()[&5], true);

        store.unregister(5, "5_200").await.unwrap();
        assert_eq!(service.online_status(&[5]).await.unwrap()[&5], false);
    }

    /// 记录调用参数的存储
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<Vec<i64>>>,
    }

    #[async_trait]
    impl PresenceStore for RecordingStore {
        async fn register(&self, _connection: &Connection) -> Result<(), PresenceError> {
            Ok(())
        }

        async fn heartbeat(
            &self,
            _user_id: i64,
            _conn_id: &str,
            _at: DateTime<Utc>,
        ) -> Result<(), PresenceError> {
            Ok(())
        }

        async fn unregister(&self, _user_id: i64, _conn_id: &str) -> Result<(), PresenceError> {
            Ok(())
        }

        async fn is_online(
            &self,
            user_ids: &[i64],
        ) -> Result<HashMap<i64, bool>, PresenceError> {
            self.calls.lock().unwrap().push(user_ids.to_vec());
            // 故意返回不完整的结果
            Ok(HashMap::from([(user_ids[0], true)]))
        }
    }

    #[tokio::test]
    async fn dedupes_and_fills_missing_ids() {
        let store = Arc::new(RecordingStore::default());
        let service = PresenceService::new(store.clone());

        let status = service.online_status(&[3, 1, 3, 2, 1]).await.unwrap();

        assert_eq!(store.calls.lock().unwrap().as_slice(), &[vec![3, 1, 2]]);
        assert_eq!(status, HashMap::from([(3, true), (1, false), (2, false)]));
    }

    struct DownStore;

    #[async_trait]
    impl PresenceStore for DownStore {
        async fn register(&self, _connection: &Connection) -> Result<(), PresenceError> {
            Err(PresenceError::Unavailable("down".into()))
        }

        async fn heartbeat(
            &self,
            _user_id: i64,
            _conn_id: &str,
            _at: DateTime<Utc>,
        ) -> Result<(), PresenceError> {
            Err(PresenceError::Unavailable("down".into()))
        }

        async fn unregister(&self, _user_id: i64, _conn_id: &str) -> Result<(), PresenceError> {
            Err(PresenceError::Unavailable("down".into()))
        }

        async fn is_online(
            &self,
            _user_ids: &[i64],
        ) -> Result<HashMap<i64, bool>, PresenceError> {
            Err(PresenceError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_store_surfaces_error() {
        let service = PresenceService::new(Arc::new(DownStore));
        assert!(matches!(
            service.online_status(&[1]).await,
            Err(PresenceError::Unavailable(_))
        ));
        // 空输入不访问存储
        assert!(service.online_status(&[]).await.unwrap().is_empty());
    }
}
