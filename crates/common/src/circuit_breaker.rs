//! 通用断路器
//!
//! 一个注册表按上下文（每个数据源一个，消息代理一个）维护互相独立的状态机：
//! Closed -> Open -> HalfOpen -> Closed
//!
//! `can_execute` 只读不写，位于每次轮询的热路径上；
//! 状态的惰性迁移（Open -> HalfOpen，HalfOpen -> Closed）只在 `get_state` 中发生。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::Display;
use relay_errors::{AppError, AppResult};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 断路器上下文
///
/// 数据源名称与消息代理分属不同变体，不会发生键冲突
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum ContextId {
    #[display("{_0}")]
    Source(String),
    #[display("broker")]
    Broker,
}

impl ContextId {
    pub fn source(name: impl Into<String>) -> Self {
        Self::Source(name.into())
    }
}

/// 断路器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// 断路器配置
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开后多久允许试探
    pub reset_timeout: Duration,
    /// 半开状态观察多少次后关闭
    pub half_open_max_attempts: u32,
    /// `execute` 的单次操作超时
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_attempts: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_at: Option<Instant>,
    half_open_attempts: u32,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_attempt_at: None,
            half_open_attempts: 0,
        }
    }
}

/// 单个上下文的状态快照（用于健康检查端点）
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub context: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
    /// 距离允许试探还剩多少毫秒
    pub retry_in_ms: Option<u64>,
}

/// 状态迁移回调
pub type TransitionHook = Arc<dyn Fn(&ContextId, BreakerState, BreakerState) + Send + Sync>;

/// 按上下文索引的断路器注册表
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    entries: Mutex<HashMap<ContextId, BreakerEntry>>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            on_transition: None,
        }
    }

    /// 设置状态迁移回调
    pub fn with_on_transition<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ContextId, BreakerState, BreakerState) + Send + Sync + 'static,
    {
        self.on_transition = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextId, BreakerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, context: &ContextId, from: BreakerState, to: BreakerState) {
        if from == to {
            return;
        }
        match to {
            BreakerState::Open => warn!(context = %context, from = from.as_str(), "Circuit breaker transitioned to OPEN"),
            BreakerState::HalfOpen => info!(context = %context, "Circuit breaker transitioned to HALF_OPEN"),
            BreakerState::Closed => info!(context = %context, from = from.as_str(), "Circuit breaker transitioned to CLOSED"),
        }
        if let Some(callback) = &self.on_transition {
            callback(context, from, to);
        }
    }

    /// 是否允许执行
    ///
    /// Open 状态下只有到达 `next_attempt_at` 才放行，但不会改写存储的状态
    pub fn can_execute(&self, context: &ContextId) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(context.clone()).or_default();

        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => entry
                .next_attempt_at
                .is_none_or(|next| Instant::now() >= next),
        }
    }

    /// 记录一次成功：清零失败计数并关闭
    pub fn record_success(&self, context: &ContextId) {
        let from = {
            let mut entries = self.lock();
            let entry = entries.entry(context.clone()).or_default();
            let from = entry.state;
            entry.failure_count = 0;
            entry.state = BreakerState::Closed;
            entry.half_open_attempts = 0;
            entry.next_attempt_at = None;
            from
        };

        self.notify(context, from, BreakerState::Closed);
    }

    /// 记录一次失败，达到阈值时打开断路器
    pub fn record_failure(&self, context: &ContextId, error_kind: &str) {
        let (from, to, failure_count) = {
            let mut entries = self.lock();
            let entry = entries.entry(context.clone()).or_default();
            let from = entry.state;

            entry.failure_count = entry.failure_count.saturating_add(1);
            entry.last_failure_time = Some(Utc::now());

            if entry.failure_count >= self.config.failure_threshold {
                entry.state = BreakerState::Open;
                entry.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
                entry.half_open_attempts = 0;
            }

            (from, entry.state, entry.failure_count)
        };

        debug!(
            context = %context,
            error_kind,
            failure_count,
            threshold = self.config.failure_threshold,
            "Circuit breaker recorded failure"
        );

        self.notify(context, from, to);
    }

    /// 读取当前状态，同时执行惰性迁移
    pub fn get_state(&self, context: &ContextId) -> BreakerState {
        let (from, to) = {
            let mut entries = self.lock();
            let entry = entries.entry(context.clone()).or_default();
            let from = entry.state;

            match entry.state {
                BreakerState::Open => {
                    if entry
                        .next_attempt_at
                        .is_none_or(|next| Instant::now() >= next)
                    {
                        entry.state = BreakerState::HalfOpen;
                        entry.half_open_attempts = 0;
                    }
                }
                BreakerState::HalfOpen => {
                    entry.half_open_attempts += 1;
                    if entry.half_open_attempts >= self.config.half_open_max_attempts {
                        entry.state = BreakerState::Closed;
                        entry.failure_count = 0;
                        entry.half_open_attempts = 0;
                        entry.next_attempt_at = None;
                    }
                }
                BreakerState::Closed => {}
            }

            (from, entry.state)
        };

        self.notify(context, from, to);
        to
    }

    /// 当前失败计数
    pub fn failure_count(&self, context: &ContextId) -> u32 {
        self.lock()
            .get(context)
            .map(|entry| entry.failure_count)
            .unwrap_or(0)
    }

    /// 所有上下文的状态快照（不触发迁移）
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = self
            .lock()
            .iter()
            .map(|(context, entry)| BreakerSnapshot {
                context: context.to_string(),
                state: entry.state,
                failure_count: entry.failure_count,
                last_failure_time: entry.last_failure_time,
                half_open_attempts: entry.half_open_attempts,
                retry_in_ms: entry
                    .next_attempt_at
                    .filter(|_| entry.state == BreakerState::Open)
                    .map(|next| next.saturating_duration_since(now).as_millis() as u64),
            })
            .collect();
        snapshots.sort_by(|a, b| a.context.cmp(&b.context));
        snapshots
    }

    /// 执行受保护的操作
    ///
    /// 拒绝执行时返回 `AppError::CircuitOpen`；超时计为失败
    pub async fn execute<F, Fut, T>(&self, context: &ContextId, f: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if !self.can_execute(context) {
            return Err(AppError::circuit_open(context.to_string()));
        }

        let result = match tokio::time::timeout(self.config.timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout(format!(
                "{} did not complete within {:?}",
                context, self.config.timeout
            ))),
        };

        match &result {
            Ok(_) => self.record_success(context),
            Err(e) => self.record_failure(context, e.kind()),
        }

        result
    }

    /// 执行受保护的操作，失败（包括被拒绝）时交给 fallback 处理
    pub async fn execute_with_fallback<F, Fut, T, FB>(
        &self,
        context: &ContextId,
        f: F,
        fallback: FB,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
        FB: FnOnce(AppError) -> AppResult<T>,
    {
        match self.execute(context, f).await {
            Ok(value) => Ok(value),
            Err(e) => fallback(e),
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
