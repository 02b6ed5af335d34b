//! 本地连接表
//!
//! 每个用户在本进程内最多一个活跃连接，分片锁内只做读写，不做 I/O。

use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Notify, mpsc};

/// 本地连接句柄，持有会话出站队列的发送端与驱逐信号
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    sender: mpsc::Sender<Message>,
    eviction: Arc<Notify>,
    pub created_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(conn_id: impl Into<String>, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
            eviction: Arc::new(Notify::new()),
            created_at: Utc::now(),
        }
    }

    /// 非阻塞投递，队列已满或会话已结束时返回 false
    pub fn try_send(&self, message: Message) -> bool {
        self.sender.try_send(message).is_ok()
    }

    pub async fn send(&self, message: Message) -> bool {
        self.sender.send(message).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// 会话读循环等待的驱逐信号
    pub fn eviction(&self) -> Arc<Notify> {
        self.eviction.clone()
    }

    /// 通知会话退出
    ///
    /// 信号不经过出站队列，队列写满时同样生效；会话尚未开始等待时保留一次许可。
    /// Close 帧只做尽力投递。
    pub fn evict(&self) {
        self.eviction.notify_one();
        let _ = self.sender.try_send(Message::Close(None));
    }
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: DashMap<i64, ConnectionHandle>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入句柄，返回被替换的旧句柄
    pub fn add(&self, user_id: i64, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(user_id, handle)
    }

    /// 仅当当前句柄属于 `conn_id` 时移除，避免旧会话清理掉新连接
    pub fn remove(&self, user_id: i64, conn_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .remove_if(&user_id, |_, handle| handle.conn_id == conn_id)
            .map(|(_, handle)| handle)
    }

    pub fn get(&self, user_id: i64) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|entry| entry.clone())
    }

    /// 取出全部句柄，表清空
    pub fn drain(&self) -> Vec<(i64, ConnectionHandle)> {
        let user_ids: Vec<i64> = self.connections.iter().map(|entry| *entry.key()).collect();
        user_ids
            .into_iter()
            .filter_map(|user_id| self.connections.remove(&user_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
