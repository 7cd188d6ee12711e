//! 中继编排器
//!
//! 生命周期：`Stopped -> Initializing -> Polling -> ShuttingDown -> Stopped`
//!
//! 单个工作协程按固定间隔轮询；每轮依次处理每个数据源，数据源内逐行处理。
//! 行状态更新是普通的 UPDATE，没有"仅当仍为 pending 时认领"的原子保护，
//! 因此同一组 outbox 表只能由一个中继实例处理。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use relay_bootstrap::HealthReporter;
use relay_common::{
    AggregatedHealthResult, BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry,
    ComponentHealth, ContextId, RetryConfig, retry_recoverable,
};
use relay_config::{CircuitBreakerSettings, RelaySettings, SourceConfig, SuccessStatus};
use relay_errors::{AppError, AppResult};
use relay_event_core::{EventEnvelope, FailureMetadata, event_topic};
use relay_ports::{
    MessageSink, OutboxRow, OutboxStatus, OutboxStore, RelayObserver, RelayOutcome,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connector::SourceConnector;
use crate::publisher::BrokerPublisher;
use crate::reader::{OutboxReader, StoreOutcome};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 中继生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Stopped,
    Initializing,
    Polling,
    ShuttingDown,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Stopped => "stopped",
            RelayState::Initializing => "initializing",
            RelayState::Polling => "polling",
            RelayState::ShuttingDown => "shutting_down",
        }
    }
}

/// 编排器参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// 失败次数达到该值时投递 DLQ
    pub max_retries: u32,
    pub retention_days: u32,
    /// 同一数据源两次成功清理的最小间隔，零表示每轮都清理
    pub cleanup_interval: Duration,
    /// 启动阶段连接数据源与代理的重试策略
    pub connect_retry: RetryConfig,
}

impl From<&RelaySettings> for OrchestratorSettings {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            batch_size: settings.batch_size,
            max_retries: settings.max_retries,
            retention_days: settings.retention_days,
            cleanup_interval: settings.cleanup_interval(),
            connect_retry: RetryConfig::new(
                settings.connect_attempts,
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

/// 断路器配置转换
pub fn breaker_config(settings: &CircuitBreakerSettings) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: settings.failure_threshold,
        reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
        half_open_max_attempts: settings.half_open_max_attempts,
        timeout: Duration::from_millis(settings.timeout_ms),
    }
}

/// 单个数据源的一轮处理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePollReport {
    pub source: String,
    /// 数据源断路器拒绝执行
    pub skipped: bool,
    /// 读取批次失败
    pub fetch_failed: bool,
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cleaned: u64,
}

impl SourcePollReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }
}

/// 一轮轮询的结果
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub sources: Vec<SourcePollReport>,
}

impl PollReport {
    pub fn source(&self, name: &str) -> Option<&SourcePollReport> {
        self.sources.iter().find(|report| report.source == name)
    }

    pub fn published(&self) -> usize {
        self.sources.iter().map(|report| report.published).sum()
    }

    pub fn failed(&self) -> usize {
        self.sources.iter().map(|report| report.failed).sum()
    }

    pub fn dead_lettered(&self) -> usize {
        self.sources.iter().map(|report| report.dead_lettered).sum()
    }
}

/// 已连接的数据源
struct RelaySource {
    name: String,
    context: ContextId,
    reader: OutboxReader,
    success_status: SuccessStatus,
    last_cleanup: Mutex<Option<Instant>>,
}

impl RelaySource {
    fn new(config: &SourceConfig, store: Arc<dyn OutboxStore>) -> Self {
        Self {
            name: config.name.clone(),
            context: ContextId::source(&config.name),
            reader: OutboxReader::new(&config.name, store),
            success_status: config.success_status(),
            last_cleanup: Mutex::new(None),
        }
    }

    /// 距上次成功清理是否已超过间隔
    fn cleanup_due(&self, interval: Duration) -> bool {
        lock(&self.last_cleanup).is_none_or(|at| at.elapsed() >= interval)
    }

    fn cleanup_succeeded(&self) {
        *lock(&self.last_cleanup) = Some(Instant::now());
    }
}

/// 中继编排器
pub struct RelayOrchestrator {
    settings: OrchestratorSettings,
    breaker: Arc<CircuitBreakerRegistry>,
    publisher: BrokerPublisher,
    observer: Arc<dyn RelayObserver>,
    sources: RwLock<Vec<Arc<RelaySource>>>,
    health: Mutex<BTreeMap<String, ComponentHealth>>,
    state: Mutex<RelayState>,
}

impl RelayOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        breaker_config: CircuitBreakerConfig,
        sink: Arc<dyn MessageSink>,
        observer: Arc<dyn RelayObserver>,
    ) -> Self {
        let transition_observer = observer.clone();
        let breaker = Arc::new(CircuitBreakerRegistry::new(breaker_config).with_on_transition(
            move |context, from, to| transition_observer.record_breaker_transition(context, from, to),
        ));

        Self {
            settings,
            publisher: BrokerPublisher::new(sink, breaker.clone()),
            breaker,
            observer,
            sources: RwLock::new(Vec::new()),
            health: Mutex::new(BTreeMap::new()),
            state: Mutex::new(RelayState::Stopped),
        }
    }

    pub fn current_state(&self) -> RelayState {
        *lock(&self.state)
    }

    pub fn breaker(&self) -> &CircuitBreakerRegistry {
        &self.breaker
    }

    /// 已连接的数据源名称
    pub fn source_names(&self) -> Vec<String> {
        self.connected_sources()
            .iter()
            .map(|source| source.name.clone())
            .collect()
    }

    /// 连接代理与所有数据源
    ///
    /// 不可达的数据源被跳过并标记为不健康；代理不可达或没有任何可达数据源时返回错误
    pub async fn initialize(
        &self,
        connector: &dyn SourceConnector,
        sources: &[SourceConfig],
    ) -> AppResult<()> {
        {
            let mut state = lock(&self.state);
            if *state != RelayState::Stopped {
                return Err(AppError::internal(format!(
                    "Cannot initialize relay in state {}",
                    state.as_str()
                )));
            }
            *state = RelayState::Initializing;
        }

        info!(sources = sources.len(), "Initializing outbox relay");

        if let Err(e) =
            retry_recoverable(&self.settings.connect_retry, "broker", || self.publisher.check())
                .await
        {
            error!(error = %e, "Message broker unreachable");
            self.set_state(RelayState::Stopped);
            return Err(e);
        }

        let mut connected = Vec::new();
        for config in sources {
            let operation = format!("connect {}", config.name);
            // 连接池建立后再 ping 一次，能应答查询才算可达
            match retry_recoverable(&self.settings.connect_retry, &operation, || async move {
                let store = connector.connect(config).await?;
                store.ping().await?;
                Ok::<_, AppError>(store)
            })
            .await
            {
                Ok(store) => {
                    info!(source = %config.name, host = %config.host, "Outbox source connected");
                    self.set_health(&config.name, None);
                    connected.push(Arc::new(RelaySource::new(config, store)));
                }
                Err(e) => {
                    warn!(source = %config.name, error = %e, "Outbox source unreachable, skipping");
                    self.set_health(&config.name, Some(e.to_string()));
                }
            }
        }

        if connected.is_empty() {
            self.set_state(RelayState::Stopped);
            return Err(AppError::database("No outbox sources reachable"));
        }

        info!(
            connected = connected.len(),
            configured = sources.len(),
            "Outbox relay initialized"
        );
        *self.sources.write().unwrap_or_else(PoisonError::into_inner) = connected;
        Ok(())
    }

    /// 启动轮询：立即执行一轮，之后按固定间隔执行，直到 token 被取消
    ///
    /// 取消时正在执行的一轮会完整跑完
    pub fn start_polling(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let previous = self.set_state(RelayState::Polling);
        if previous != RelayState::Initializing {
            warn!(state = previous.as_str(), "Polling started without initialization");
        }

        tokio::spawn(async move {
            info!(
                interval_ms = self.settings.poll_interval.as_millis() as u64,
                batch_size = self.settings.batch_size,
                "Outbox relay polling started"
            );

            let mut ticker = tokio::time::interval(self.settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("Outbox relay received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.poll_once().await;
                        log_report(&report);
                    }
                }
            }

            info!("Outbox relay polling stopped");
        })
    }

    /// 关闭：刷新代理中尚未确认的消息
    pub async fn shutdown(&self, flush_timeout: Duration) {
        self.set_state(RelayState::ShuttingDown);
        info!("Shutting down outbox relay");

        let publisher = self.publisher.clone();
        // flush 是阻塞调用
        if let Err(e) = tokio::task::spawn_blocking(move || publisher.flush(flush_timeout)).await {
            error!(error = %e, "Broker flush task failed");
        }

        self.set_state(RelayState::Stopped);
        info!("Outbox relay stopped");
    }

    /// 执行一轮轮询
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        // 代理断路器只在发送时把关：被拒绝的发送与其他发布失败一样计入尝试次数
        for source in self.connected_sources() {
            report.sources.push(self.poll_source(&source).await);
        }

        report
    }

    async fn poll_source(&self, source: &RelaySource) -> SourcePollReport {
        let started = Instant::now();
        let mut report = SourcePollReport::new(&source.name);

        let state = self.breaker.get_state(&source.context);
        if !self.breaker.can_execute(&source.context) {
            debug!(source = %source.name, state = state.as_str(), "Source circuit open, skipping");
            report.skipped = true;
            self.set_health(&source.name, Some("circuit breaker open".to_string()));
            return report;
        }

        let fetched = source.reader.get_pending_events(self.settings.batch_size).await;
        if let Some(e) = fetched.error {
            self.breaker.record_failure(&source.context, e.kind());
            self.set_health(&source.name, Some(e.to_string()));
            report.fetch_failed = true;
            self.observer.record_poll_duration(&source.name, started.elapsed());
            return report;
        }

        let rows = fetched.value;
        report.fetched = rows.len();
        self.observer.record_queue_depth(&source.name, rows.len());

        for row in rows {
            self.process_row(source, row, &mut report).await;
        }

        self.set_health(&source.name, None);

        if source.cleanup_due(self.settings.cleanup_interval) {
            let cleaned = source
                .reader
                .cleanup_old_events(self.settings.retention_days)
                .await;
            report.cleaned = cleaned.value;
            if cleaned.error.is_none() {
                source.cleanup_succeeded();
            }
            if cleaned.value > 0 {
                self.observer.record_cleanup(&source.name, cleaned.value);
            }
        }

        self.observer.record_poll_duration(&source.name, started.elapsed());
        report
    }

    async fn process_row(&self, source: &RelaySource, row: OutboxRow, report: &mut SourcePollReport) {
        // 认领之前检查，终态行与已被认领的行都不再处理
        if !row.status.can_transition_to(OutboxStatus::Processing) {
            debug!(
                source = %source.name,
                event_id = %row.id,
                status = row.status.as_str(),
                "Outbox row cannot be claimed, skipping"
            );
            return;
        }

        let claimed = source.reader.mark_as_processing(&row.id).await;
        self.note_store_error(source, &claimed);
        if !claimed.value {
            warn!(source = %source.name, event_id = %row.id, "Failed to claim outbox row, continuing");
        }

        let topic = event_topic(&source.name, &row.event_type);

        let envelope = match EventEnvelope::from_row(&row, &source.name, Utc::now()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    source = %source.name,
                    event_id = %row.id,
                    event_type = %row.event_type,
                    error = %e,
                    "Failed to process outbox row"
                );
                let marked = source.reader.mark_as_failed(&row.id, &e.to_string()).await;
                self.note_store_error(source, &marked);
                report.failed += 1;
                self.observer
                    .record_event(&source.name, &row.event_type, RelayOutcome::Failed, &topic);
                return;
            }
        };

        match self
            .publisher
            .publish_event(&source.name, &topic, &envelope)
            .await
        {
            Ok(()) => {
                self.breaker.record_success(&source.context);

                let marked = match source.success_status {
                    SuccessStatus::Completed => source.reader.mark_as_completed(&row.id).await,
                    SuccessStatus::Published => source.reader.mark_as_published(&row.id).await,
                };
                self.note_store_error(source, &marked);
                if !marked.value {
                    warn!(
                        source = %source.name,
                        event_id = %row.id,
                        "Event published but row status was not updated"
                    );
                }

                report.published += 1;
                self.observer
                    .record_event(&source.name, &row.event_type, RelayOutcome::Published, &topic);
            }
            Err(e) => {
                self.handle_publish_failure(source, &row, &envelope, &topic, e, report)
                    .await;
            }
        }
    }

    /// 发布失败：尝试次数加一，记录断路器失败，达到上限时投递 DLQ，最后标记为失败
    ///
    /// 标记为 `failed` 的行仍在轮询集合中，所以超过上限的行每一轮都会再次投递 DLQ
    async fn handle_publish_failure(
        &self,
        source: &RelaySource,
        row: &OutboxRow,
        envelope: &EventEnvelope,
        topic: &str,
        error: AppError,
        report: &mut SourcePollReport,
    ) {
        let incremented = source.reader.increment_attempts(&row.id).await;
        self.note_store_error(source, &incremented);

        let attempts = row.attempts.saturating_add(1);
        self.breaker.record_failure(&source.context, error.kind());
        report.failed += 1;

        let mut outcome = RelayOutcome::Failed;
        if attempts >= self.settings.max_retries {
            let failure = FailureMetadata {
                service: source.name.clone(),
                attempts,
                last_attempt_at: Utc::now(),
            };
            if self
                .publisher
                .publish_to_dlq(envelope, &error, failure)
                .await
                .is_ok()
            {
                report.dead_lettered += 1;
                outcome = RelayOutcome::DeadLettered;
                self.observer.record_dlq(&source.name, &row.event_type);
            }
        }

        let marked = source.reader.mark_as_failed(&row.id, &error.to_string()).await;
        self.note_store_error(source, &marked);

        self.observer
            .record_event(&source.name, &row.event_type, outcome, topic);
    }

    fn note_store_error<T>(&self, source: &RelaySource, outcome: &StoreOutcome<T>) {
        if let Some(e) = &outcome.error {
            self.breaker.record_failure(&source.context, e.kind());
        }
    }

    fn connected_sources(&self) -> Vec<Arc<RelaySource>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, next: RelayState) -> RelayState {
        let mut state = lock(&self.state);
        let previous = *state;
        *state = next;
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "Relay state changed");
        }
        previous
    }

    fn set_health(&self, source: &str, error: Option<String>) {
        let component = match error {
            None => ComponentHealth::healthy(source),
            Some(error) => ComponentHealth::unhealthy(source, error),
        };
        lock(&self.health).insert(source.to_string(), component);
    }
}

impl HealthReporter for RelayOrchestrator {
    fn health(&self) -> AggregatedHealthResult {
        AggregatedHealthResult::from_components(lock(&self.health).values().cloned())
    }

    fn state(&self) -> &'static str {
        self.current_state().as_str()
    }

    fn is_ready(&self) -> bool {
        self.current_state() == RelayState::Polling
    }

    fn breakers(&self) -> Vec<BreakerSnapshot> {
        self.breaker.snapshot()
    }
}

fn log_report(report: &PollReport) {
    for source in &report.sources {
        if source.published > 0 || source.failed > 0 || source.cleaned > 0 {
            info!(
                source = %source.source,
                fetched = source.fetched,
                published = source.published,
                failed = source.failed,
                dead_lettered = source.dead_lettered,
                cleaned = source.cleaned,
                "Outbox poll completed"
            );
        }
    }
}
