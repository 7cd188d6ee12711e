//! 中继观测能力
//!
//! 作为依赖注入每个组件，而不是全局单例；测试中使用 `NoopObserver`

use std::time::Duration;

use relay_common::{BreakerState, ContextId};

/// 单个事件的中继结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Published,
    Failed,
    DeadLettered,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Published => "published",
            RelayOutcome::Failed => "failed",
            RelayOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// 观测回调
pub trait RelayObserver: Send + Sync {
    /// 记录一次事件中继结果
    fn record_event(&self, source: &str, event_type: &str, outcome: RelayOutcome, topic: &str);

    /// 记录一次 DLQ 投递
    fn record_dlq(&self, source: &str, event_type: &str);

    /// 记录断路器状态迁移
    fn record_breaker_transition(&self, context: &ContextId, from: BreakerState, to: BreakerState);

    /// 记录待处理队列深度（本轮读取到的行数）
    fn record_queue_depth(&self, source: &str, depth: usize);

    /// 记录单个数据源一轮轮询的耗时
    fn record_poll_duration(&self, source: &str, duration: Duration);

    /// 记录清理删除的行数
    fn record_cleanup(&self, source: &str, deleted: u64);
}

/// 空实现
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RelayObserver for NoopObserver {
    fn record_event(&self, _: &str, _: &str, _: RelayOutcome, _: &str) {}
    fn record_dlq(&self, _: &str, _: &str) {}
    fn record_breaker_transition(&self, _: &ContextId, _: BreakerState, _: BreakerState) {}
    fn record_queue_depth(&self, _: &str, _: usize) {}
    fn record_poll_duration(&self, _: &str, _: Duration) {}
    fn record_cleanup(&self, _: &str, _: u64) {}
}
