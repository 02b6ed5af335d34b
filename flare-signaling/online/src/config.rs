use std::time::Duration;

use anyhow::Result;
use flare_im_core::config::{DEFAULT_PRESENCE_PROFILE, FlareAppConfig};
use flare_im_core::service_names::SIGNALING_ONLINE;

const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 90;
const DEFAULT_GRPC_PORT: u16 = 60061;

#[derive(Debug, Clone)]
pub struct OnlineConfig {
    pub service_name: String,
    /// gRPC 监听地址
    pub address: String,
    /// 在线状态存储使用的 redis profile
    pub presence_profile: String,
    /// 在线记录 TTL
    pub presence_ttl: Duration,
}

impl OnlineConfig {
    /// 从应用配置加载
    pub fn from_app_config(app: &FlareAppConfig) -> Result<Self> {
        let service_config = app.signaling_online_service();

        let presence_profile = service_config
            .presence_store
            .clone()
            .unwrap_or_else(|| DEFAULT_PRESENCE_PROFILE.to_string());

        // 服务级 TTL 优先，其次 redis profile 的 TTL
        let ttl_seconds = service_config
            .presence_ttl_seconds
            .or_else(|| {
                app.redis_profile(&presence_profile)
                    .and_then(|profile| profile.ttl_seconds)
            })
            .unwrap_or(DEFAULT_PRESENCE_TTL_SECONDS);
        if ttl_seconds == 0 {
            anyhow::bail!("presence ttl must be greater than zero");
        }

        let mut server = service_config.server.clone().unwrap_or_default();
        if server.port.is_none() {
            server.port = Some(DEFAULT_GRPC_PORT);
        }

        Ok(Self {
            service_name: service_config
                .service_name
                .clone()
                .unwrap_or_else(|| SIGNALING_ONLINE.to_string()),
            address: app.compose_server_addr(Some(&server)),
            presence_profile,
            presence_ttl: Duration::from_secs(ttl_seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_im_core::config::parse_config;

    #[test]
    fn ttl_falls_back_to_redis_profile() {
        let app = parse_config(
            r#"
            [redis.presence]
            url = "redis://127.0.0.1:6379"
            ttl_seconds = 45
            "#,
        )
        .unwrap();
        let config = OnlineConfig::from_app_config(&app).unwrap();
        assert_eq!(config.presence_ttl, Duration::from_secs(45));
        assert_eq!(config.address, "0.0.0.0:60061");
        assert_eq!(config.service_name, SIGNALING_ONLINE);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let app = parse_config(
            r#"
            [services.signaling_online]
            presence_ttl_seconds = 0
            "#,
        )
        .unwrap();
        assert!(OnlineConfig::from_app_config(&app).is_err());
    }
}
