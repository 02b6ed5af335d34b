//! gRPC 客户端连接管理

pub mod client_manager;

pub use client_manager::{
    ConnectionState, ConnectionStats, Dialer, EndpointDialer, GrpcClient, GrpcClientError,
    GrpcClientManager,
};
