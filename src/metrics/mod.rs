//! # Prometheus 指标收集模块
//!
//! 为接入网关与在线状态服务提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 接入网关指标
pub struct AccessGatewayMetrics {
    /// 活跃连接数
    pub connections_active: IntGauge,
    /// 建立连接总数
    pub connections_total: IntCounter,
    /// 拒绝连接次数
    pub connections_rejected_total: IntCounterVec,
    /// 连接断开次数
    pub connection_disconnected_total: IntCounter,
    /// 接收帧数（按消息类型）
    pub frames_received_total: IntCounterVec,
    /// 无法解码的帧
    pub malformed_frames_total: IntCounter,
    /// 转发到消息服务失败次数
    pub forward_failure_total: IntCounter,
    /// 在线状态存储失败次数
    pub presence_store_failure_total: IntCounterVec,
}

impl AccessGatewayMetrics {
    pub fn new() -> Self {
        let connections_active =
            IntGauge::new("gateway_connections_active", "Number of active connections")
                .expect("Failed to create gateway_connections_active metric");

        let connections_total = IntCounter::new(
            "gateway_connections_total",
            "Total number of accepted connections",
        )
        .expect("Failed to create gateway_connections_total metric");

        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "gateway_connections_rejected_total",
                "Total number of rejected upgrade requests",
            ),
            &["reason"],
        )
        .expect("Failed to create gateway_connections_rejected_total metric");

        let connection_disconnected_total = IntCounter::new(
            "gateway_connection_disconnected_total",
            "Total number of disconnected connections",
        )
        .expect("Failed to create gateway_connection_disconnected_total metric");

        let frames_received_total = IntCounterVec::new(
            Opts::new(
                "gateway_frames_received_total",
                "Total number of frames received",
            ),
            &["message_type"],
        )
        .expect("Failed to create gateway_frames_received_total metric");

        let malformed_frames_total = IntCounter::new(
            "gateway_malformed_frames_total",
            "Total number of frames dropped because they could not be decoded",
        )
        .expect("Failed to create gateway_malformed_frames_total metric");

        let forward_failure_total = IntCounter::new(
            "gateway_forward_failure_total",
            "Total number of messages that failed to reach the message service",
        )
        .expect("Failed to create gateway_forward_failure_total metric");

        let presence_store_failure_total = IntCounterVec::new(
            Opts::new(
                "gateway_presence_store_failure_total",
                "Total number of failed presence store operations",
            ),
            &["operation"],
        )
        .expect("Failed to create gateway_presence_store_failure_total metric");

        // 重复注册（多实例 / 测试）时忽略错误
        let _ = REGISTRY.register(Box::new(connections_active.clone()));
        let _ = REGISTRY.register(Box::new(connections_total.clone()));
        let _ = REGISTRY.register(Box::new(connections_rejected_total.clone()));
        let _ = REGISTRY.register(Box::new(connection_disconnected_total.clone()));
        let _ = REGISTRY.register(Box::new(frames_received_total.clone()));
        let _ = REGISTRY.register(Box::new(malformed_frames_total.clone()));
        let _ = REGISTRY.register(Box::new(forward_failure_total.clone()));
        let _ = REGISTRY.register(Box::new(presence_store_failure_total.clone()));

        Self {
            connections_active,
            connections_total,
            connections_rejected_total,
            connection_disconnected_total,
            frames_received_total,
            malformed_frames_total,
            forward_failure_total,
            presence_store_failure_total,
        }
    }
}

impl Default for AccessGatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
