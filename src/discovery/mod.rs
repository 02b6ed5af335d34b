//! 服务发现模块
//!
//! 通过容器编排平台的服务注册表（Kubernetes Service / Endpoints）发现下游服务实例，
//! 并通过 watch 保持本地实例表实时更新。
//!
//! ## 使用方式
//!
//! ```rust,ignore
//! use flare_im_core::discovery::{LoadBalancer, ServiceDiscovery};
//!
//! let discovery = ServiceDiscovery::from_config(&app_config.discovery).await?;
//! let instances = discovery.get_all_service_instances("flare-message-service").await?;
//! let instance = LoadBalancer::round_robin().select("flare-message-service", &instances)?;
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

pub mod kubernetes;
pub mod load_balancer;
pub mod service_discovery;

pub use kubernetes::KubernetesSource;
pub use load_balancer::{LoadBalanceError, LoadBalanceStrategy, LoadBalancer};
pub use service_discovery::{ServiceDiscovery, WatchBackoff};

/// 服务实例
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub host: String,
    /// HTTP 端口
    pub port: u16,
    pub grpc_port: u16,
    pub healthy: bool,
    /// 标签
    pub metadata: HashMap<String, String>,
    pub last_check: DateTime<Utc>,
}

impl ServiceInstance {
    /// gRPC 拨号地址（`http://host:grpc_port`）
    pub fn grpc_endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.grpc_port)
    }
}

/// 服务发现错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("service {0} is not known to discovery")]
    UnknownService(String),
    #[error("service {0} has no registered instances")]
    NoInstances(String),
    #[error("service {0} has no healthy instances")]
    NoHealthyInstances(String),
    #[error("service registry request failed: {0}")]
    Source(String),
    #[error("discovery configuration error: {0}")]
    Configuration(String),
}

/// 服务列表快照
#[derive(Debug, Clone, Default)]
pub struct ServiceList {
    pub names: Vec<String>,
    /// 用于从该快照开始 watch 的资源版本
    pub resource_version: Option<String>,
}

/// 服务变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(String),
    Modified(String),
    Deleted(String),
    /// watch 出错，需要放弃当前 watch 并重建
    Error(String),
}

/// 服务注册表数据源
#[async_trait]
pub trait ServiceSource: Send + Sync {
    /// 全量列出服务
    async fn list_services(&self) -> Result<ServiceList, DiscoveryError>;

    /// 解析服务的实例列表
    async fn resolve(&self, service_name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    /// 从指定资源版本开始 watch 服务变更，流结束表示 watch 被服务端关闭
    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<BoxStream<'static, ServiceEvent>, DiscoveryError>;
}
