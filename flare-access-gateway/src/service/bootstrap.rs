//! 应用启动器 - 负责依赖注入和服务启动

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use flare_im_core::FlareAppConfig;
use flare_im_core::discovery::{LoadBalancer, ServiceDiscovery};
use flare_im_core::grpc::GrpcClientManager;
use flare_im_core::id::SnowflakeGenerator;
use flare_im_core::metrics::AccessGatewayMetrics;
use flare_signaling_online::{PresenceService, build_presence_store};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::application::{ConnectionRegistry, MessageRouter};
use crate::config::AccessGatewayConfig;
use crate::infrastructure::{GrpcMessageForwarder, JwtTokenValidator};
use crate::interface::{GatewayState, build_router};

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub config: Arc<AccessGatewayConfig>,
    pub state: Arc<GatewayState>,
    pub discovery: Arc<ServiceDiscovery>,
}

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run(config: &'static FlareAppConfig) -> Result<()> {
        let context = Self::create_context(config).await?;
        Self::start_server(context).await
    }

    /// 创建应用上下文
    pub async fn create_context(app: &FlareAppConfig) -> Result<ApplicationContext> {
        let config = Arc::new(
            AccessGatewayConfig::from_app_config(app)
                .context("Failed to load access gateway configuration")?,
        );

        let id_generator = Arc::new(
            SnowflakeGenerator::new(config.machine_id).context("Failed to create id generator")?,
        );

        let store = build_presence_store(
            app,
            Some(config.presence_profile.as_str()),
            config.heartbeat_timeout,
        );
        let presence = Arc::new(PresenceService::new(store));
        let metrics = Arc::new(AccessGatewayMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(
            presence,
            metrics.clone(),
            config.reject_on_presence_failure,
        ));

        let discovery = ServiceDiscovery::from_config(&app.discovery)
            .await
            .context("Failed to initialize service discovery")?;
        let grpc_clients = Arc::new(GrpcClientManager::new());
        let forwarder = Arc::new(GrpcMessageForwarder::new(
            discovery.clone(),
            LoadBalancer::round_robin(),
            grpc_clients.clone(),
            config.message_service.clone(),
            config.gateway_id.clone(),
            config.grpc_max_retries,
        ));

        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            forwarder,
            id_generator.clone(),
        ));
        let validator = Arc::new(JwtTokenValidator::new(
            &config.token_secret,
            config.token_issuer.as_deref(),
        ));

        let state = Arc::new(GatewayState {
            config: config.clone(),
            registry,
            router,
            validator,
            id_generator,
            metrics,
            grpc_clients,
        });

        Ok(ApplicationContext {
            config,
            state,
            discovery,
        })
    }

    /// 启动 HTTP / WebSocket 服务，收到 Ctrl-C 后停止
    pub async fn start_server(context: ApplicationContext) -> Result<()> {
        let addr: SocketAddr = context
            .config
            .address
            .parse()
            .with_context(|| format!("invalid listen address {}", context.config.address))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!(
            %addr,
            gateway_id = %context.config.gateway_id,
            ws_path = %context.config.ws_path,
            machine_id = context.config.machine_id,
            "starting access gateway"
        );

        let app = build_router(context.state.clone());
        let registry = context.state.registry.clone();
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            // 先让会话退出，否则升级后的长连接会拖住优雅退出
            registry.shutdown().await;
        })
        .await;

        // 服务出错退出时同样清理；表已空时为空操作
        context.state.registry.shutdown().await;

        context.discovery.stop().await;
        if let Err(err) = context.state.grpc_clients.close_all().await {
            warn!(error = %err, "failed to close grpc connections");
        }

        if let Err(err) = &result {
            error!(error = %err, "access gateway failed");
        }
        info!("access gateway stopped");
        result.context("http server failed")
    }
}
