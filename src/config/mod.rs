//! Flare IM Core 配置模块
//!
//! 该模块提供了完整的应用程序配置管理功能，包括：
//! - 配置文件加载和解析（单文件或配置目录）
//! - 环境特定配置覆盖
//! - 接入网关、在线状态、服务发现等配置定义

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use toml::Value;
use tracing::warn;

mod manager;
pub use manager::{ConfigManager, DEFAULT_PRESENCE_PROFILE};

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<FlareAppConfig> = OnceLock::new();

/// 服务基本信息
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// 服务名称
    pub name: String,
    /// 服务版本
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "flare-im-core".to_string(),
            version: default_version(),
        }
    }
}

/// 监听地址配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_address")]
    pub address: String,
    /// 监听端口
    #[serde(default)]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: 0,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: false,
            with_thread_ids: true,
            with_file: true,
            with_line_number: true,
        }
    }
}

/// Redis 连接池配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisPoolConfig {
    /// Redis 服务器地址
    pub url: String,
    /// 命名空间前缀
    #[serde(default)]
    pub namespace: Option<String>,
    /// 数据库编号
    #[serde(default)]
    pub database: Option<u32>,
    /// 过期时间（秒）
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// 服务发现配置
///
/// 通过容器编排平台（Kubernetes）的 Service / Endpoints 对象发现下游服务
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// 是否启用 Kubernetes 服务发现（关闭时使用 static_endpoints）
    #[serde(default)]
    pub enabled: bool,
    /// API Server 地址
    #[serde(default = "default_api_server")]
    pub api_server: String,
    /// 命名空间
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 标签选择器
    #[serde(default = "default_label_selector")]
    pub label_selector: String,
    /// ServiceAccount token 路径
    #[serde(default = "default_token_path")]
    pub token_path: String,
    /// 集群 CA 证书路径
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: String,
    /// watch 失败后的初始退避（毫秒）
    #[serde(default = "default_backoff_initial_ms")]
    pub watch_backoff_initial_ms: u64,
    /// watch 失败后的最大退避（毫秒）
    #[serde(default = "default_backoff_max_ms")]
    pub watch_backoff_max_ms: u64,
    /// 静态服务端点：服务名 -> ["host:grpc_port", ...]
    #[serde(default)]
    pub static_endpoints: HashMap<String, Vec<String>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_server: default_api_server(),
            namespace: default_namespace(),
            label_selector: default_label_selector(),
            token_path: default_token_path(),
            ca_cert_path: default_ca_cert_path(),
            watch_backoff_initial_ms: default_backoff_initial_ms(),
            watch_backoff_max_ms: default_backoff_max_ms(),
            static_endpoints: HashMap::new(),
        }
    }
}

/// 服务端点配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceEndpointConfig {
    /// 服务地址
    pub address: Option<String>,
    /// 服务端口
    pub port: Option<u16>,
}

/// 接入网关服务配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AccessGatewayServiceConfig {
    /// 服务名称
    #[serde(default)]
    pub service_name: Option<String>,
    /// 监听配置
    #[serde(default)]
    pub server: Option<ServiceEndpointConfig>,
    /// 网关实例 ID
    #[serde(default)]
    pub gateway_id: Option<String>,
    /// WebSocket 升级路径
    #[serde(default)]
    pub ws_path: Option<String>,
    /// 心跳超时（秒），同时作为在线记录 TTL
    #[serde(default)]
    pub heartbeat_timeout_seconds: Option<u64>,
    /// Snowflake 机器 ID（0-1023，每个网关副本唯一）
    #[serde(default)]
    pub machine_id: Option<u16>,
    /// 在线状态存储（redis profile 名称）
    #[serde(default)]
    pub presence_store: Option<String>,
    /// 消息逻辑服务名
    #[serde(default)]
    pub message_service: Option<String>,
    /// 令牌密钥
    #[serde(default)]
    pub token_secret: Option<String>,
    /// 令牌发行方
    #[serde(default)]
    pub token_issuer: Option<String>,
    /// gRPC 拨号最大重试次数
    #[serde(default)]
    pub grpc_max_retries: Option<u32>,
    /// 在线状态写入失败时是否拒绝连接
    #[serde(default)]
    pub reject_on_presence_failure: Option<bool>,
    /// 单连接出站队列长度
    #[serde(default)]
    pub outbound_buffer: Option<usize>,
}

/// 在线状态服务配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SignalingOnlineServiceConfig {
    /// 服务名称
    #[serde(default)]
    pub service_name: Option<String>,
    /// 监听配置
    #[serde(default)]
    pub server: Option<ServiceEndpointConfig>,
    /// 在线状态存储（redis profile 名称）
    #[serde(default)]
    pub presence_store: Option<String>,
    /// 在线记录 TTL（秒）
    #[serde(default)]
    pub presence_ttl_seconds: Option<u64>,
}

/// 服务配置集合
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServicesConfig {
    /// 接入网关服务配置
    #[serde(default)]
    pub access_gateway: Option<AccessGatewayServiceConfig>,
    /// 在线状态服务配置
    #[serde(default)]
    pub signaling_online: Option<SignalingOnlineServiceConfig>,
}

/// Flare 应用配置主结构体
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FlareAppConfig {
    /// 服务信息
    #[serde(default)]
    pub service: ServiceConfig,
    /// 监听配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis 配置映射
    #[serde(default)]
    pub redis: HashMap<String, RedisPoolConfig>,
    /// 服务发现配置
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// 服务配置
    #[serde(default)]
    pub services: ServicesConfig,
}

impl FlareAppConfig {
    /// 获取 Redis 配置
    pub fn redis_profile(&self, name: &str) -> Option<&RedisPoolConfig> {
        self.redis.get(name)
    }

    /// 获取接入网关服务配置
    pub fn access_gateway_service(&self) -> AccessGatewayServiceConfig {
        self.services.access_gateway.clone().unwrap_or_default()
    }

    /// 获取在线状态服务配置
    pub fn signaling_online_service(&self) -> SignalingOnlineServiceConfig {
        self.services.signaling_online.clone().unwrap_or_default()
    }

    /// 组合服务监听地址：服务级配置优先，其次全局 server 配置
    pub fn compose_server_addr(&self, server: Option<&ServiceEndpointConfig>) -> String {
        let address = server
            .and_then(|s| s.address.clone())
            .unwrap_or_else(|| self.server.address.clone());
        let port = server.and_then(|s| s.port).unwrap_or(self.server.port);
        format!("{}:{}", address, port)
    }

    /// 确保配置有默认值
    fn ensure_defaults(&mut self) {
        if self.server.address.is_empty() {
            self.server.address = default_address();
        }
        if self.server.port == 0 {
            self.server.port = 60051;
        }
    }
}

/// 加载配置
///
/// 依次尝试 `path`（或默认的 `config` 目录、`config.toml` 文件），
/// 然后叠加环境配置与环境变量覆盖
pub fn load_config(path: Option<&str>) -> &'static FlareAppConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    APP_CONFIG.get_or_init(|| load_with_fallback(&candidates))
}

/// 获取应用配置（未初始化时返回 None）
pub fn app_config() -> Option<&'static FlareAppConfig> {
    APP_CONFIG.get()
}

/// 从 TOML 字符串解析配置（不触碰全局实例）
pub fn parse_config(content: &str) -> Result<FlareAppConfig> {
    let value: Value = toml::from_str(content).context("invalid config format")?;
    finalize(value)
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> FlareAppConfig {
    for path in candidates {
        match load_config_from_source(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    let mut cfg = FlareAppConfig::default();
    ConfigManager::apply_env_overrides(&mut cfg);
    cfg.ensure_defaults();
    cfg
}

/// 从源加载配置
fn load_config_from_source(path: &Path) -> Result<FlareAppConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    let value = if metadata.is_dir() {
        load_directory_value(path)?
    } else {
        load_toml_value(path)?
    };
    finalize(value)
}

/// 叠加环境配置、环境变量并反序列化
fn finalize(mut value: Value) -> Result<FlareAppConfig> {
    if let Err(e) = ConfigManager::load_environment_config(&mut value) {
        warn!("failed to load environment config: {}", e);
    }
    let mut cfg: FlareAppConfig = value
        .try_into()
        .context("invalid configuration after merging")?;
    ConfigManager::apply_env_overrides(&mut cfg);
    cfg.ensure_defaults();
    Ok(cfg)
}

/// 从目录加载配置
fn load_directory_value(path: &Path) -> Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("services"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 合并目录中的配置
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 合并值
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_namespace() -> String {
    "flare".to_string()
}

fn default_label_selector() -> String {
    "app.kubernetes.io/part-of=flare-im".to_string()
}

fn default_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_ca_cert_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}
