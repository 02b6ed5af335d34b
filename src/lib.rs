//! Flare IM Core 公共库
//!
//! 提供统一的配置加载、日志、指标、Snowflake ID、服务发现与 gRPC 连接池

pub mod config;
pub mod discovery;
pub mod error;
pub mod grpc;
pub mod id;
pub mod metrics;
pub mod service_names;
pub mod tracing;
pub mod utils;

pub use config::{
    AccessGatewayServiceConfig, ConfigManager, DiscoveryConfig, FlareAppConfig, LoggingConfig,
    RedisPoolConfig, ServiceEndpointConfig, SignalingOnlineServiceConfig, app_config,
    load_config, parse_config,
};
pub use discovery::{
    DiscoveryError, LoadBalanceStrategy, LoadBalancer, ServiceDiscovery, ServiceInstance,
};
pub use error::{ErrorBuilder, ErrorCode, FlareError, Result};
pub use grpc::{GrpcClient, GrpcClientError, GrpcClientManager};
pub use id::{SnowflakeGenerator, parse_id};
pub use utils::current_millis;
