//! 服务发现实例表
//!
//! 启动时全量同步一次，随后由后台 watch 任务增量维护：
//! - Added / Modified：重新解析该服务的实例并整体替换
//! - Deleted：移除该服务
//! - Error / 流结束：放弃当前 watch，按指数退避重建（重建前重新全量同步）
//!
//! 只有 [`ServiceDiscovery::stop`] 会结束后台任务。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DiscoveryError, KubernetesSource, ServiceEvent, ServiceInstance, ServiceSource};
use crate::config::DiscoveryConfig;
use crate::utils::split_host_port;

type InstanceTable = Arc<RwLock<HashMap<String, Vec<ServiceInstance>>>>;

/// watch 重建退避参数
#[derive(Debug, Clone, Copy)]
pub struct WatchBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl WatchBackoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// 服务发现
pub struct ServiceDiscovery {
    services: InstanceTable,
    stop_tx: watch::Sender<bool>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDiscovery {
    /// 根据配置构建：启用时连接 Kubernetes，否则使用静态端点
    pub async fn from_config(config: &DiscoveryConfig) -> Result<Arc<Self>, DiscoveryError> {
        if !config.enabled {
            info!(
                services = config.static_endpoints.len(),
                "kubernetes discovery disabled, using static endpoints"
            );
            return Ok(Arc::new(Self::from_static(&config.static_endpoints)));
        }

        let source = Arc::new(KubernetesSource::from_config(config)?);
        let backoff = WatchBackoff {
            initial: Duration::from_millis(config.watch_backoff_initial_ms),
            max: Duration::from_millis(config.watch_backoff_max_ms),
        };
        Ok(Self::start(source, backoff).await)
    }

    /// 使用静态端点（`host:grpc_port`）构建，不启动 watch
    pub fn from_static(endpoints: &HashMap<String, Vec<String>>) -> Self {
        let now = Utc::now();
        let mut table = HashMap::new();

        for (service_name, addresses) in endpoints {
            let mut instances = Vec::with_capacity(addresses.len());
            for address in addresses {
                let Some((host, port)) = split_host_port(address) else {
                    warn!(service = %service_name, address = %address, "ignoring invalid static endpoint");
                    continue;
                };
                instances.push(ServiceInstance {
                    service_name: service_name.clone(),
                    host,
                    port,
                    grpc_port: port,
                    healthy: true,
                    metadata: HashMap::from([("source".to_string(), "static".to_string())]),
                    last_check: now,
                });
            }
            table.insert(service_name.clone(), instances);
        }

        let (stop_tx, _) = watch::channel(false);
        Self {
            services: Arc::new(RwLock::new(table)),
            stop_tx,
            watch_task: Mutex::new(None),
        }
    }

    /// 全量同步并启动后台 watch 任务
    ///
    /// 首次同步失败不会返回错误，后台任务会按退避重试。
    pub async fn start(source: Arc<dyn ServiceSource>, backoff: WatchBackoff) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let services: InstanceTable = Arc::new(RwLock::new(HashMap::new()));

        let resource_version = match sync_all(source.as_ref(), &services).await {
            Ok(version) => version,
            Err(err) => {
                warn!(error = %err, "initial service discovery sync failed, will retry in watch loop");
                None
            }
        };

        let task = tokio::spawn(run_watch(
            source,
            services.clone(),
            stop_rx,
            backoff,
            resource_version,
        ));

        Arc::new(Self {
            services,
            stop_tx,
            watch_task: Mutex::new(Some(task)),
        })
    }

    /// 获取服务的第一个健康实例
    pub async fn get_service_instance(
        &self,
        service_name: &str,
    ) -> Result<ServiceInstance, DiscoveryError> {
        let services = self.services.read().await;
        let instances = services
            .get(service_name)
            .ok_or_else(|| DiscoveryError::UnknownService(service_name.to_string()))?;

        if instances.is_empty() {
            return Err(DiscoveryError::NoInstances(service_name.to_string()));
        }

        instances
            .iter()
            .find(|i| i.healthy)
            .cloned()
            .ok_or_else(|| DiscoveryError::NoHealthyInstances(service_name.to_string()))
    }

    /// 获取服务的全部实例（含不健康实例）
    pub async fn get_all_service_instances(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        self.services
            .read()
            .await
            .get(service_name)
            .cloned()
            .ok_or_else(|| DiscoveryError::UnknownService(service_name.to_string()))
    }

    /// 获取全部服务及其实例（实例表快照）
    pub async fn get_all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.services.read().await.clone()
    }

    /// 停止后台 watch 任务并等待其退出
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.watch_task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "service discovery watch task ended abnormally");
            }
            info!("service discovery stopped");
        }
    }
}

/// 全量同步，返回可用于 watch 的资源版本
async fn sync_all(
    source: &dyn ServiceSource,
    services: &InstanceTable,
) -> Result<Option<String>, DiscoveryError> {
    let list = source.list_services().await?;

    let mut table = HashMap::with_capacity(list.names.len());
    for name in list.names {
        match source.resolve(&name).await {
            Ok(instances) => {
                table.insert(name, instances);
            }
            Err(err) => {
                warn!(service = %name, error = %err, "failed to resolve service instances");
                table.insert(name, Vec::new());
            }
        }
    }

    debug!(services = table.len(), "service discovery synced");
    *services.write().await = table;
    Ok(list.resource_version)
}

async fn refresh_service(source: &dyn ServiceSource, services: &InstanceTable, name: String) {
    match source.resolve(&name).await {
        Ok(instances) => {
            debug!(service = %name, instances = instances.len(), "service instances updated");
            services.write().await.insert(name, instances);
        }
        Err(err) => {
            warn!(service = %name, error = %err, "failed to refresh service instances");
        }
    }
}

async fn run_watch(
    source: Arc<dyn ServiceSource>,
    services: InstanceTable,
    mut stop_rx: watch::Receiver<bool>,
    backoff: WatchBackoff,
    mut resource_version: Option<String>,
) {
    let mut delay = backoff.initial;
    let mut needs_resync = resource_version.is_none();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        if needs_resync {
            match sync_all(source.as_ref(), &services).await {
                Ok(version) => {
                    resource_version = version;
                    needs_resync = false;
                }
                Err(err) => {
                    warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "service discovery sync failed");
                    if !sleep_or_stop(&mut stop_rx, delay).await {
                        break;
                    }
                    delay = backoff.next(delay);
                    continue;
                }
            }
        }

        let stream = tokio::select! {
            _ = stop_rx.changed() => break,
            result = source.watch(resource_version.clone()) => result,
        };

        match stream {
            Ok(mut events) => {
                info!("service discovery watch established");
                loop {
                    let event = tokio::select! {
                        _ = stop_rx.changed() => return,
                        event = events.next() => event,
                    };

                    match event {
                        Some(ServiceEvent::Added(name)) | Some(ServiceEvent::Modified(name)) => {
                            delay = backoff.initial;
                            refresh_service(source.as_ref(), &services, name).await;
                        }
                        Some(ServiceEvent::Deleted(name)) => {
                            delay = backoff.initial;
                            info!(service = %name, "service removed");
                            services.write().await.remove(&name);
                        }
                        Some(ServiceEvent::Error(reason)) => {
                            warn!(reason = %reason, "service discovery watch failed");
                            break;
                        }
                        None => {
                            debug!("service discovery watch closed by server");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to establish service discovery watch");
            }
        }

        needs_resync = true;
        if !sleep_or_stop(&mut stop_rx, delay).await {
            break;
        }
        delay = backoff.next(delay);
    }

    debug!("service discovery watch loop exited");
}

/// 等待退避时间，收到停止信号时返回 false
async fn sleep_or_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = stop_rx.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
