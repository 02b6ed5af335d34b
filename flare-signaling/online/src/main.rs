//! Signaling Online 服务入口
//!
//! 提供 `flare.online.OnlineStatusService` gRPC 接口，在线状态数据由接入网关写入。

use flare_im_core::{load_config, tracing::init_tracing_from_config};
use flare_signaling_online::service::ApplicationBootstrap;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = load_config(Some("config"));
    init_tracing_from_config(Some(&app_config.logging));

    info!("✅ 配置加载完成");
    ApplicationBootstrap::run(app_config).await
}
