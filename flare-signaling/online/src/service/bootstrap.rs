//! 应用启动器 - 负责依赖注入和服务启动
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use flare_im_core::FlareAppConfig;
use flare_proto::flare::online::online_status_service_server::OnlineStatusServiceServer;
use tonic::transport::Server;
use tracing::{error, info};

use crate::application::PresenceService;
use crate::config::OnlineConfig;
use crate::infrastructure::persistence::build_presence_store;
use crate::interface::grpc::{OnlineHandler, OnlineStatusServer};

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub config: OnlineConfig,
    pub presence_service: Arc<PresenceService>,
    pub server: OnlineStatusServer,
}

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run(config: &'static FlareAppConfig) -> Result<()> {
        let context = Self::create_context(config)?;
        Self::start_server(context).await
    }

    /// 创建应用上下文
    pub fn create_context(config: &FlareAppConfig) -> Result<ApplicationContext> {
        let online_config = OnlineConfig::from_app_config(config)
            .context("Failed to load online service configuration")?;

        let store = build_presence_store(
            config,
            Some(online_config.presence_profile.as_str()),
            online_config.presence_ttl,
        );
        let presence_service = Arc::new(PresenceService::new(store));

        let handler = Arc::new(OnlineHandler::new(presence_service.clone()));
        let server = OnlineStatusServer::from_handler(handler);

        Ok(ApplicationContext {
            config: online_config,
            presence_service,
            server,
        })
    }

    /// 启动 gRPC 服务器，收到 Ctrl-C 后停止
    pub async fn start_server(context: ApplicationContext) -> Result<()> {
        let addr: SocketAddr = context
            .config
            .address
            .parse()
            .with_context(|| format!("invalid listen address {}", context.config.address))?;
        info!(%addr, service = %context.config.service_name, "starting signaling online service");

        let result = Server::builder()
            .add_service(OnlineStatusServiceServer::new(context.server))
            .serve_with_shutdown(addr, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!(error = %err, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
            })
            .await;

        if let Err(err) = &result {
            error!(error = %err, "signaling online service failed");
        }
        info!("signaling online service stopped");
        result.context("grpc server failed")
    }
}
