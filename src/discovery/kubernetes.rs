//! Kubernetes 服务注册表数据源
//!
//! 通过 API Server 的 REST 接口读取 `Service` 与 `Endpoints` 对象：
//! - `addresses` 中的地址视为健康实例，`notReadyAddresses` 视为不健康实例
//! - 端口按名称识别：`grpc` 为 gRPC 端口，`http` 为 HTTP 端口
//! - 同时 watch `Service` 与 `Endpoints`：实例扩缩容与就绪状态变化只体现在 `Endpoints` 上
//! - watch 返回按行分隔的 JSON 事件流

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, future};
use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DiscoveryError, ServiceEvent, ServiceInstance, ServiceList, ServiceSource};
use crate::config::DiscoveryConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// 服务端在该时长后主动关闭 watch，随后重新全量同步
const WATCH_TIMEOUT_SECONDS: u64 = 300;

/// Kubernetes 数据源
pub struct KubernetesSource {
    client: Client,
    api_server: String,
    namespace: String,
    label_selector: String,
    token: Option<String>,
}

impl KubernetesSource {
    /// 从服务发现配置构建（读取 ServiceAccount token 与集群 CA）
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let token = match fs::read_to_string(&config.token_path) {
            Ok(token) => Some(token.trim().to_string()),
            Err(err) => {
                warn!(path = %config.token_path, error = %err, "service account token not readable, using anonymous requests");
                None
            }
        };

        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        match fs::read(&config.ca_cert_path) {
            Ok(pem) => {
                let cert = Certificate::from_pem(&pem).map_err(|err| {
                    DiscoveryError::Configuration(format!(
                        "invalid cluster CA {}: {err}",
                        config.ca_cert_path
                    ))
                })?;
                builder = builder.add_root_certificate(cert);
            }
            Err(err) => {
                warn!(path = %config.ca_cert_path, error = %err, "cluster CA not readable, using system roots");
            }
        }

        let client = builder
            .build()
            .map_err(|err| DiscoveryError::Configuration(err.to_string()))?;

        Ok(Self {
            client,
            api_server: config.api_server.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            label_selector: config.label_selector.clone(),
            token,
        })
    }

    fn services_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/services", self.api_server, self.namespace)
    }

    fn endpoints_list_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/endpoints", self.api_server, self.namespace)
    }

    fn endpoints_url(&self, service_name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/endpoints/{}",
            self.api_server, self.namespace, service_name
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn watch_resource(
        &self,
        kind: WatchedKind,
        resource_version: Option<String>,
    ) -> Result<BoxStream<'static, ServiceEvent>, DiscoveryError> {
        let mut query = vec![
            ("labelSelector", self.label_selector.clone()),
            ("watch", "true".to_string()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECONDS.to_string()),
        ];
        if let Some(version) = resource_version {
            query.push(("resourceVersion", version));
        }

        let url = match kind {
            WatchedKind::Service => self.services_url(),
            WatchedKind::Endpoints => self.endpoints_list_url(),
        };
        let request = self.client.get(url).query(&query);
        let response = self
            .authorized(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| DiscoveryError::Source(format!("watch {}: {err}", kind.as_str())))?;

        let body = response.bytes_stream().boxed();
        let events = stream::unfold(
            (body, Vec::<u8>::new(), VecDeque::<ServiceEvent>::new()),
            move |(mut body, mut buffer, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (body, buffer, pending)));
                    }

                    match body.next().await {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                                let line: Vec<u8> = buffer.drain(..=pos).collect();
                                if let Some(event) = parse_watch_line(kind, &line) {
                                    pending.push_back(event);
                                }
                            }
                        }
                        Some(Err(err)) => {
                            pending.push_back(ServiceEvent::Error(format!(
                                "{} watch stream broken: {err}",
                                kind.as_str()
                            )));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}

/// watch 的资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchedKind {
    Service,
    Endpoints,
}

impl WatchedKind {
    fn as_str(&self) -> &'static str {
        match self {
            WatchedKind::Service => "services",
            WatchedKind::Endpoints => "endpoints",
        }
    }
}

/// 流结束时产出一个 `None` 标记
fn until_end(events: BoxStream<'static, ServiceEvent>) -> BoxStream<'static, Option<ServiceEvent>> {
    events.map(Some).chain(stream::once(async { None })).boxed()
}

#[async_trait]
impl ServiceSource for KubernetesSource {
    async fn list_services(&self) -> Result<ServiceList, DiscoveryError> {
        let request = self
            .client
            .get(self.services_url())
            .query(&[("labelSelector", self.label_selector.as_str())])
            .timeout(REQUEST_TIMEOUT);

        let response = self
            .authorized(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| DiscoveryError::Source(format!("list services: {err}")))?;

        let list: ServiceListObject = response
            .json()
            .await
            .map_err(|err| DiscoveryError::Source(format!("decode service list: {err}")))?;

        Ok(ServiceList {
            names: list.items.into_iter().map(|s| s.metadata.name).collect(),
            resource_version: list.metadata.resource_version,
        })
    }

    async fn resolve(&self, service_name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let request = self
            .client
            .get(self.endpoints_url(service_name))
            .timeout(REQUEST_TIMEOUT);

        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| DiscoveryError::Source(format!("get endpoints {service_name}: {err}")))?;

        // Service 已创建但 Endpoints 尚未生成
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let endpoints: EndpointsObject = response
            .error_for_status()
            .map_err(|err| DiscoveryError::Source(format!("get endpoints {service_name}: {err}")))?
            .json()
            .await
            .map_err(|err| {
                DiscoveryError::Source(format!("decode endpoints {service_name}: {err}"))
            })?;

        Ok(instances_from_endpoints(service_name, endpoints))
    }

    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<BoxStream<'static, ServiceEvent>, DiscoveryError> {
        let services = self
            .watch_resource(WatchedKind::Service, resource_version.clone())
            .await?;
        let endpoints = self
            .watch_resource(WatchedKind::Endpoints, resource_version)
            .await?;

        // 任一 watch 结束即整体结束，由上层重新全量同步后重建
        let merged = stream::select(until_end(services), until_end(endpoints))
            .take_while(|event| future::ready(event.is_some()))
            .filter_map(future::ready);
        Ok(merged.boxed())
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    resource_version: Option<String>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ServiceObject {
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct ServiceListObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    items: Vec<ServiceObject>,
}

#[derive(Debug, Deserialize)]
struct EndpointsObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointSubset {
    #[serde(default)]
    addresses: Vec<EndpointAddress>,
    #[serde(default)]
    not_ready_addresses: Vec<EndpointAddress>,
    #[serde(default)]
    ports: Vec<EndpointPort>,
}

#[derive(Debug, Deserialize)]
struct EndpointAddress {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct EndpointPort {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: serde_json::Value,
}

fn named_port(ports: &[EndpointPort], name: &str) -> Option<u16> {
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.port)
}

fn instances_from_endpoints(service_name: &str, endpoints: EndpointsObject) -> Vec<ServiceInstance> {
    let now = Utc::now();
    let mut instances = Vec::new();

    for subset in endpoints.subsets {
        // 单端口服务未命名端口时，同时作为 gRPC 与 HTTP 端口
        let fallback = if subset.ports.len() == 1 {
            Some(subset.ports[0].port)
        } else {
            None
        };
        let Some(grpc_port) = named_port(&subset.ports, "grpc").or(fallback) else {
            debug!(service = %service_name, "endpoint subset has no grpc port, skipping");
            continue;
        };
        let http_port = named_port(&subset.ports, "http").unwrap_or(grpc_port);

        let ready = subset.addresses.into_iter().map(|a| (a, true));
        let not_ready = subset.not_ready_addresses.into_iter().map(|a| (a, false));
        for (address, healthy) in ready.chain(not_ready) {
            instances.push(ServiceInstance {
                service_name: service_name.to_string(),
                host: address.ip,
                port: http_port,
                grpc_port,
                healthy,
                metadata: endpoints.metadata.labels.clone(),
                last_check: now,
            });
        }
    }

    instances
}

fn parse_watch_line(kind: WatchedKind, line: &[u8]) -> Option<ServiceEvent> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }

    let event: RawWatchEvent = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(err) => return Some(ServiceEvent::Error(format!("malformed watch event: {err}"))),
    };

    if event.kind == "ERROR" {
        let message = event
            .object
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown watch error")
            .to_string();
        return Some(ServiceEvent::Error(message));
    }

    let name = event
        .object
        .pointer("/metadata/name")
        .and_then(|n| n.as_str())?
        .to_string();

    // Endpoints 与 Service 同名；其任何变化都只需重新解析该服务的实例
    if kind == WatchedKind::Endpoints {
        return matches!(event.kind.as_str(), "ADDED" | "MODIFIED" | "DELETED")
            .then(|| ServiceEvent::Modified(name));
    }

    match event.kind.as_str() {
        "ADDED" => Some(ServiceEvent::Added(name)),
        "MODIFIED" => Some(ServiceEvent::Modified(name)),
        "DELETED" => Some(ServiceEvent::Deleted(name)),
        _ => None,
    }
}
