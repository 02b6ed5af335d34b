use std::time::Duration;

use anyhow::{Result, bail};
use flare_im_core::config::{DEFAULT_PRESENCE_PROFILE, FlareAppConfig};
use flare_im_core::id::MAX_MACHINE_ID;
use flare_im_core::service_names::{ACCESS_GATEWAY, MESSAGE_SERVICE};
use uuid::Uuid;

const DEFAULT_WS_PATH: &str = "/ws";
const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 90;
const DEFAULT_GRPC_MAX_RETRIES: u32 = 3;
const DEFAULT_OUTBOUND_BUFFER: usize = 256;
const DEFAULT_PORT: u16 = 60050;

#[derive(Debug, Clone)]
pub struct AccessGatewayConfig {
    pub service_name: String,
    /// HTTP / WebSocket 监听地址
    pub address: String,
    /// 网关实例 ID，写入每条在线记录
    pub gateway_id: String,
    pub ws_path: String,
    /// 心跳超时，同时作为在线记录 TTL 与读循环空闲超时
    pub heartbeat_timeout: Duration,
    pub machine_id: u16,
    pub presence_profile: String,
    pub message_service: String,
    pub token_secret: String,
    pub token_issuer: Option<String>,
    pub grpc_max_retries: u32,
    /// 在线状态写入失败时拒绝连接（默认放行并记录告警）
    pub reject_on_presence_failure: bool,
    pub outbound_buffer: usize,
}

impl AccessGatewayConfig {
    pub fn from_app_config(app: &FlareAppConfig) -> Result<Self> {
        let service = app.access_gateway_service();

        let heartbeat_seconds = service
            .heartbeat_timeout_seconds
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS);
        if heartbeat_seconds == 0 {
            bail!("heartbeat timeout must be greater than zero");
        }

        let machine_id = service.machine_id.unwrap_or(0);
        if machine_id > MAX_MACHINE_ID {
            bail!("machine id {machine_id} out of range [0, {MAX_MACHINE_ID}]");
        }

        let ws_path = service
            .ws_path
            .unwrap_or_else(|| DEFAULT_WS_PATH.to_string());
        if !ws_path.starts_with('/') {
            bail!("websocket path must start with '/': {ws_path}");
        }

        let token_secret = match service.token_secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => bail!("services.access_gateway.token_secret is required"),
        };

        let gateway_id = service
            .gateway_id
            .unwrap_or_else(|| format!("gateway-{}", &Uuid::new_v4().simple().to_string()[..8]));

        let mut server = service.server.unwrap_or_default();
        if server.port.is_none() {
            server.port = Some(DEFAULT_PORT);
        }

        Ok(Self {
            service_name: service
                .service_name
                .unwrap_or_else(|| ACCESS_GATEWAY.to_string()),
            address: app.compose_server_addr(Some(&server)),
            gateway_id,
            ws_path,
            heartbeat_timeout: Duration::from_secs(heartbeat_seconds),
            machine_id,
            presence_profile: service
                .presence_store
                .unwrap_or_else(|| DEFAULT_PRESENCE_PROFILE.to_string()),
            message_service: service
                .message_service
                .unwrap_or_else(|| MESSAGE_SERVICE.to_string()),
            token_secret,
            token_issuer: service.token_issuer,
            grpc_max_retries: service
                .grpc_max_retries
                .unwrap_or(DEFAULT_GRPC_MAX_RETRIES),
            reject_on_presence_failure: service.reject_on_presence_failure.unwrap_or(false),
            outbound_buffer: service
                .outbound_buffer
                .unwrap_or(DEFAULT_OUTBOUND_BUFFER)
                .max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_im_core::config::parse_config;

    #[test]
    fn defaults_are_applied() {
        let app = parse_config(
            r#"
            [services.access_gateway]
            token_secret = "s3cret"
            "#,
        )
        .unwrap();
        let config = AccessGatewayConfig::from_app_config(&app).unwrap();

        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(config.address, "0.0.0.0:60050");
        assert_eq!(config.message_service, MESSAGE_SERVICE);
        assert_eq!(config.presence_profile, DEFAULT_PRESENCE_PROFILE);
        assert!(config.gateway_id.starts_with("gateway-"));
        assert!(!config.reject_on_presence_failure);
        assert_eq!(config.grpc_max_retries, 3);
    }

    #[test]
    fn explicit_values_win() {
        let app = parse_config(
            r#"
            [services.access_gateway]
            gateway_id = "gw-sh-1"
            ws_path = "/connect"
            heartbeat_timeout_seconds = 30
            machine_id = 17
            token_secret = "s3cret"
            token_issuer = "flare"
            reject_on_presence_failure = true

            [services.access_gateway.server]
            port = 9000
            "#,
        )
        .unwrap();
        let config = AccessGatewayConfig::from_app_config(&app).unwrap();

        assert_eq!(config.gateway_id, "gw-sh-1");
        assert_eq!(config.ws_path, "/connect");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.machine_id, 17);
        assert_eq!(config.token_issuer.as_deref(), Some("flare"));
        assert!(config.reject_on_presence_failure);
        assert_eq!(config.address, "0.0.0.0:9000");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for snippet in [
            "machine_id = 1024\ntoken_secret = \"s\"",
            "heartbeat_timeout_seconds = 0\ntoken_secret = \"s\"",
            "ws_path = \"ws\"\ntoken_secret = \"s\"",
            "machine_id = 1",
        ] {
            let app = parse_config(&format!("[services.access_gateway]\n{snippet}")).unwrap();
            assert!(
                AccessGatewayConfig::from_app_config(&app).is_err(),
                "accepted: {snippet}"
            );
        }
    }
}
