//! 负载均衡器
//!
//! 从服务实例列表中选择一个健康实例：
//! - 轮询（RoundRobin）：每个服务独立计数
//! - 随机（Random）：在健康实例中均匀随机

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use thiserror::Error;

use super::ServiceInstance;

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    /// 轮询（默认）
    #[default]
    RoundRobin,
    /// 随机
    Random,
}

/// 负载均衡错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadBalanceError {
    #[error("no instances registered for service {0}")]
    NoInstances(String),
    #[error("no healthy instances for service {0}")]
    NoHealthyInstances(String),
}

/// 负载均衡器
#[derive(Debug, Default)]
pub struct LoadBalancer {
    strategy: LoadBalanceStrategy,
    /// 每个服务的轮询计数器
    robin_counters: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            robin_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn round_robin() -> Self {
        Self::new(LoadBalanceStrategy::RoundRobin)
    }

    pub fn random() -> Self {
        Self::new(LoadBalanceStrategy::Random)
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// 选择一个健康实例
    pub fn select(
        &self,
        service_name: &str,
        instances: &[ServiceInstance],
    ) -> Result<ServiceInstance, LoadBalanceError> {
        if instances.is_empty() {
            return Err(LoadBalanceError::NoInstances(service_name.to_string()));
        }

        let healthy: Vec<&ServiceInstance> = instances.iter().filter(|i| i.healthy).collect();
        if healthy.is_empty() {
            return Err(LoadBalanceError::NoHealthyInstances(
                service_name.to_string(),
            ));
        }

        let index = match self.strategy {
            LoadBalanceStrategy::RoundRobin => {
                self.counter(service_name).fetch_add(1, Ordering::Relaxed) % healthy.len()
            }
            LoadBalanceStrategy::Random => rand::thread_rng().gen_range(0..healthy.len()),
        };

        Ok(healthy[index].clone())
    }

    fn counter(&self, service_name: &str) -> Arc<AtomicUsize> {
        let mut counters = self
            .robin_counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }
}
