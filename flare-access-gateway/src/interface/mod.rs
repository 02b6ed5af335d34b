pub mod connection;
pub mod http;
pub mod websocket;

use std::sync::Arc;

use flare_im_core::grpc::GrpcClientManager;
use flare_im_core::id::SnowflakeGenerator;
use flare_im_core::metrics::AccessGatewayMetrics;

use crate::application::{ConnectionRegistry, MessageRouter};
use crate::config::AccessGatewayConfig;
use crate::domain::TokenValidator;

pub use http::build_router;

/// axum 共享状态
pub struct GatewayState {
    pub config: Arc<AccessGatewayConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub validator: Arc<dyn TokenValidator>,
    pub id_generator: Arc<SnowflakeGenerator>,
    pub metrics: Arc<AccessGatewayMetrics>,
    pub grpc_clients: Arc<GrpcClientManager>,
}
