//! 聚合健康状态
//!
//! 按组件（数据源）记录健康布尔值，汇总为负载均衡因子 = 健康数 / 总数

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 整体健康判定阈值：负载均衡因子必须严格大于该值
pub const HEALTHY_FACTOR_THRESHOLD: f64 = 0.5;

/// 组件健康状态
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// 组件名称
    pub name: String,
    /// 是否健康
    pub healthy: bool,
    /// 最近一次错误
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 最近一次更新时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            error: None,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            error: Some(error.into()),
            updated_at: Some(Utc::now()),
        }
    }
}

/// 聚合多个组件的健康状态
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedHealthResult {
    /// 整体是否健康
    pub healthy: bool,
    /// 健康组件占比
    pub load_balance_factor: f64,
    /// 各组件状态
    pub components: Vec<ComponentHealth>,
}

impl AggregatedHealthResult {
    pub fn new() -> Self {
        Self {
            healthy: false,
            load_balance_factor: 0.0,
            components: Vec::new(),
        }
    }

    pub fn from_components(components: impl IntoIterator<Item = ComponentHealth>) -> Self {
        let mut result = Self::new();
        for component in components {
            result.add_component(component);
        }
        result
    }

    /// 添加组件状态并重新计算汇总值
    pub fn add_component(&mut self, component: ComponentHealth) {
        self.components.push(component);
        self.load_balance_factor = self.compute_factor();
        self.healthy = self.load_balance_factor > HEALTHY_FACTOR_THRESHOLD;
    }

    pub fn healthy_count(&self) -> usize {
        self.components.iter().filter(|c| c.healthy).count()
    }

    pub fn total_count(&self) -> usize {
        self.components.len()
    }

    fn compute_factor(&self) -> f64 {
        if self.components.is_empty() {
            return 0.0;
        }
        self.healthy_count() as f64 / self.total_count() as f64
    }
}

impl Default for AggregatedHealthResult {
    fn default() -> Self {
        Self::new()
    }
}
