//! # gRPC 客户端连接池
//!
//! 每个逻辑服务名维护一个共享的 HTTP/2 连接（tonic `Channel`）：
//! - 首次访问时拨号并缓存，后续访问复用
//! - 连接不可用（`TransientFailure` / `Shutdown`）时丢弃，按调用方给出的地址重拨（只替换，不修改）
//! - 服务发现不再列出的地址由 [`GrpcClientManager::evict_unlisted`] 移出连接池
//! - 拨号在锁外进行，锁只保护连接表的读写
//!
//! tonic 不暴露连接状态，状态由调用方在 RPC 成败后通过 [`GrpcClient`] 标记。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

/// 重试基础间隔：第 n 次失败后等待 n × 该值
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Ready = 1,
    TransientFailure = 2,
    Shutdown = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Ready,
            2 => ConnectionState::TransientFailure,
            _ => ConnectionState::Shutdown,
        }
    }

    /// Idle / Ready 视为健康
    pub fn is_healthy(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Ready => "READY",
            ConnectionState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectionState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// gRPC 客户端错误
#[derive(Debug, Error)]
pub enum GrpcClientError {
    #[error("failed to dial {service} at {address}: {reason}")]
    Dial {
        service: String,
        address: String,
        reason: String,
    },
    #[error("failed to connect to {service} after {attempts} attempts: {source}")]
    RetriesExhausted {
        service: String,
        attempts: u32,
        #[source]
        source: Box<GrpcClientError>,
    },
    #[error("failed to close {} connection(s): {}", .0.len(), .0.join("; "))]
    Close(Vec<String>),
}

/// 拨号器
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, service: &str, address: &str) -> Result<Channel, GrpcClientError>;

    /// 关闭连接，默认直接丢弃 Channel
    async fn close(&self, _service: &str, channel: Channel) -> Result<(), GrpcClientError> {
        drop(channel);
        Ok(())
    }
}

/// 基于 tonic Endpoint 的默认拨号器
#[derive(Debug, Clone)]
pub struct EndpointDialer {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
}

impl Default for EndpointDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(20),
        }
    }
}

impl EndpointDialer {
    /// 构建 Endpoint（缺少 scheme 时补 `http://`）
    pub fn endpoint(&self, service: &str, address: &str) -> Result<Endpoint, GrpcClientError> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        Ok(Endpoint::from_shared(uri)
            .map_err(|err| GrpcClientError::Dial {
                service: service.to_string(),
                address: address.to_string(),
                reason: err.to_string(),
            })?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .http2_keep_alive_interval(self.keep_alive_interval)
            .keep_alive_timeout(self.keep_alive_timeout)
            .keep_alive_while_idle(true)
            .tcp_nodelay(true))
    }
}

#[async_trait]
impl Dialer for EndpointDialer {
    async fn dial(&self, service: &str, address: &str) -> Result<Channel, GrpcClientError> {
        self.endpoint(service, address)?
            .connect()
            .await
            .map_err(|err| GrpcClientError::Dial {
                service: service.to_string(),
                address: address.to_string(),
                reason: err.to_string(),
            })
    }
}

struct PooledConnection {
    address: String,
    channel: Channel,
    state: Arc<AtomicU8>,
    created_at: DateTime<Utc>,
}

impl PooledConnection {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn client(&self, service: &str) -> GrpcClient {
        GrpcClient {
            service: service.to_string(),
            address: self.address.clone(),
            channel: self.channel.clone(),
            state: self.state.clone(),
        }
    }
}

/// 连接池中连接的句柄
#[derive(Clone)]
pub struct GrpcClient {
    service: String,
    address: String,
    channel: Channel,
    state: Arc<AtomicU8>,
}

impl GrpcClient {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 获取底层 Channel（克隆开销很小）
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn mark_ready(&self) {
        self.set_state(ConnectionState::Ready);
    }

    /// RPC 出现传输层错误时调用
    pub fn mark_transient_failure(&self) {
        self.set_state(ConnectionState::TransientFailure);
    }

    /// 标记为不可用，下次获取时重拨
    pub fn mark_shutdown(&self) {
        self.set_state(ConnectionState::Shutdown);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(
                service = %self.service,
                from = %ConnectionState::from_u8(previous),
                to = %state,
                "grpc connection state changed"
            );
        }
    }
}

impl fmt::Debug for GrpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcClient")
            .field("service", &self.service)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// 连接统计
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub address: String,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
}

/// gRPC 客户端管理器
pub struct GrpcClientManager {
    pool: Mutex<HashMap<String, PooledConnection>>,
    dialer: Arc<dyn Dialer>,
    retry_interval: Duration,
}

impl Default for GrpcClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcClientManager {
    pub fn new() -> Self {
        Self::with_dialer(Arc::new(EndpointDialer::default()))
    }

    pub fn with_dialer(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            dialer,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, HashMap<String, PooledConnection>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 获取服务的共享连接，不存在或不可用时拨号到 `address`
    pub async fn get_grpc_client(
        &self,
        service: &str,
        address: &str,
    ) -> Result<GrpcClient, GrpcClientError> {
        {
            let pool = self.lock_pool();
            if let Some(conn) = pool.get(service) {
                if conn.state().is_healthy() {
                    return Ok(conn.client(service));
                }
                debug!(
                    service = %service,
                    pooled = %conn.address,
                    state = %conn.state(),
                    address = %address,
                    "pooled connection unusable, redialing"
                );
            }
        }

        let channel = self.dialer.dial(service, address).await?;
        let fresh = PooledConnection {
            address: address.to_string(),
            channel,
            state: Arc::new(AtomicU8::new(ConnectionState::Ready as u8)),
            created_at: Utc::now(),
        };

        let mut pool = self.lock_pool();
        if let Some(existing) = pool.get(service) {
            // 并发拨号时保留先写入的可用连接
            if existing.state().is_healthy() {
                return Ok(existing.client(service));
            }
        }

        info!(service = %service, address = %address, "grpc connection established");
        let client = fresh.client(service);
        pool.insert(service.to_string(), fresh);
        Ok(client)
    }

    /// 池中连接的地址不在 `live_addresses` 中时将其移出，返回是否移出
    ///
    /// 被移出的连接标记为 `Shutdown`，仍持有句柄的调用方据此感知。
    pub fn evict_unlisted(&self, service: &str, live_addresses: &[String]) -> bool {
        let mut pool = self.lock_pool();
        let listed = match pool.get(service) {
            Some(conn) => live_addresses.iter().any(|addr| *addr == conn.address),
            None => return false,
        };
        if listed {
            return false;
        }
        let Some(stale) = pool.remove(service) else {
            return false;
        };
        stale
            .state
            .store(ConnectionState::Shutdown as u8, Ordering::Release);
        info!(
            service = %service,
            address = %stale.address,
            "pooled address no longer discovered, dropping connection"
        );
        true
    }

    /// 带重试地获取连接：第 n 次失败后等待 n × 重试间隔
    pub async fn get_grpc_client_with_retry(
        &self,
        service: &str,
        address: &str,
        max_retries: u32,
    ) -> Result<GrpcClient, GrpcClientError> {
        let max_attempts = max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.get_grpc_client(service, address).await {
                Ok(client) => return Ok(client),
                Err(err) if attempt >= max_attempts => {
                    return Err(GrpcClientError::RetriesExhausted {
                        service: service.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.retry_interval * attempt;
                    warn!(
                        service = %service,
                        attempt,
                        max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "grpc connection attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// 关闭所有连接，汇总全部关闭错误，连接表总会被清空
    pub async fn close_all(&self) -> Result<(), GrpcClientError> {
        let connections: Vec<(String, PooledConnection)> = self.lock_pool().drain().collect();

        let mut failures = Vec::new();
        for (service, conn) in connections {
            conn.state
                .store(ConnectionState::Shutdown as u8, Ordering::Release);
            if let Err(err) = self.dialer.close(&service, conn.channel).await {
                warn!(service = %service, error = %err, "failed to close grpc connection");
                failures.push(format!("{service}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GrpcClientError::Close(failures))
        }
    }

    /// 各服务连接统计
    pub fn get_connection_stats(&self) -> HashMap<String, ConnectionStats> {
        self.lock_pool()
            .iter()
            .map(|(service, conn)| {
                (
                    service.clone(),
                    ConnectionStats {
                        address: conn.address.clone(),
                        state: conn.state(),
                        created_at: conn.created_at,
                    },
                )
            })
            .collect()
    }

    /// 各服务连接健康状态
    pub fn health_check(&self) -> HashMap<String, bool> {
        self.lock_pool()
            .iter()
            .map(|(service, conn)| (service.clone(), conn.state().is_healthy()))
            .collect()
    }
}
