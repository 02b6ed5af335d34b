//! 配置管理器 - 负责处理不同环境下的配置选择和覆盖
//!
//! 该模块提供了配置管理功能，包括：
//! - 加载环境特定配置（config/environments/{env}.toml）
//! - 使用环境变量覆盖关键部署参数

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;
use tracing::warn;

use super::{FlareAppConfig, RedisPoolConfig, merge_value};

/// 默认的在线状态 Redis profile 名称
pub const DEFAULT_PRESENCE_PROFILE: &str = "presence";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 FLARE_ENV 获取当前环境名称，
    /// 如果未设置则默认为 "development"
    pub fn get_environment() -> String {
        env::var("FLARE_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 根据环境加载特定配置
    ///
    /// 加载 config/environments/{environment}.toml 文件中的配置，
    /// 并将其合并到基础配置中
    pub fn load_environment_config(base: &mut Value) -> Result<()> {
        let env = Self::get_environment();
        let env_config_path = format!("config/environments/{}.toml", env);

        if Path::new(&env_config_path).exists() {
            let content = fs::read_to_string(&env_config_path)
                .with_context(|| format!("无法读取环境配置文件: {}", env_config_path))?;
            let overlay: Value = toml::from_str(&content)
                .with_context(|| format!("无效的环境配置格式: {}", env_config_path))?;
            merge_value(base, overlay);
        }

        Ok(())
    }

    /// 使用环境变量覆盖部署相关配置
    ///
    /// - `GATEWAY_ID`：网关实例 ID
    /// - `FLARE_MACHINE_ID`：Snowflake 机器 ID
    /// - `FLARE_REDIS_URL`：在线状态 Redis 地址
    pub fn apply_env_overrides(config: &mut FlareAppConfig) {
        let gateway = config.services.access_gateway.get_or_insert_with(Default::default);

        if let Ok(gateway_id) = env::var("GATEWAY_ID") {
            if !gateway_id.is_empty() {
                gateway.gateway_id = Some(gateway_id);
            }
        }

        if let Ok(raw) = env::var("FLARE_MACHINE_ID") {
            match raw.parse::<u16>() {
                Ok(machine_id) => gateway.machine_id = Some(machine_id),
                Err(err) => warn!(value = %raw, error = %err, "ignoring invalid FLARE_MACHINE_ID"),
            }
        }

        if let Ok(url) = env::var("FLARE_REDIS_URL") {
            let profile = gateway
                .presence_store
                .clone()
                .unwrap_or_else(|| DEFAULT_PRESENCE_PROFILE.to_string());
            config
                .redis
                .entry(profile)
                .or_insert_with(RedisPoolConfig::default)
                .url = url;
        }
    }
}
