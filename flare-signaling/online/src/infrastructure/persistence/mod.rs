pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use flare_im_core::config::FlareAppConfig;
use tracing::{info, warn};

pub use self::memory::InMemoryPresenceStore;
pub use self::redis::RedisPresenceStore;
use crate::domain::repository::PresenceStore;

/// 根据 redis profile 构建在线状态存储
///
/// 未配置 profile 或 Redis 客户端创建失败时回退到内存存储（仅单实例可见）。
pub fn build_presence_store(
    app: &FlareAppConfig,
    profile: Option<&str>,
    ttl: Duration,
) -> Arc<dyn PresenceStore> {
    let redis_config = profile.and_then(|name| app.redis_profile(name));

    match redis_config {
        Some(config) => match RedisPresenceStore::new(config, ttl) {
            Ok(store) => {
                info!(url = %config.url, ttl_secs = ttl.as_secs(), "using redis presence store");
                Arc::new(store)
            }
            Err(err) => {
                warn!(error = %err, "failed to create redis presence store, falling back to in-memory store");
                Arc::new(InMemoryPresenceStore::new(ttl))
            }
        },
        None => {
            warn!(
                profile = profile.unwrap_or("<none>"),
                "redis profile not configured, using in-memory presence store"
            );
            Arc::new(InMemoryPresenceStore::new(ttl))
        }
    }
}
