//! 内存实现
//!
//! 供单元测试、集成测试与本地演练使用，行为与 PostgreSQL / Kafka 适配器保持一致

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_config::SourceConfig;
use relay_errors::{AppError, AppResult};
use relay_ports::{MessageSink, OutboundMessage, OutboxRow, OutboxStatus, OutboxStore};
use tracing::warn;

use crate::connector::SourceConnector;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============ Outbox 存储 ============

/// 内存 outbox 表
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<OutboxRow>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<OutboxRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn insert(&self, row: OutboxRow) {
        lock(&self.rows).push(row);
    }

    /// 读取失败开关（模拟连接丢失）
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 写入失败开关
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<OutboxRow> {
        lock(&self.rows).clone()
    }

    pub fn row(&self, id: &str) -> Option<OutboxRow> {
        lock(&self.rows).iter().find(|row| row.id == id).cloned()
    }

    fn check_reads(&self) -> AppResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::database("connection refused"));
        }
        Ok(())
    }

    fn check_writes(&self) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::database("connection reset by peer"));
        }
        Ok(())
    }

    fn update<F>(&self, id: &str, apply: F) -> AppResult<bool>
    where
        F: FnOnce(&mut OutboxRow, DateTime<Utc>),
    {
        self.check_writes()?;

        let mut rows = lock(&self.rows);
        match rows.iter_mut().find(|row| row.id == id) {
            Some(row) => {
                let now = Utc::now();
                apply(row, now);
                row.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 条件状态迁移：当前状态不允许迁移到 `next` 时不修改并返回 false，与 PostgreSQL 适配器一致
    fn transition<F>(&self, id: &str, next: OutboxStatus, apply: F) -> AppResult<bool>
    where
        F: FnOnce(&mut OutboxRow, DateTime<Utc>),
    {
        self.check_writes()?;

        let mut rows = lock(&self.rows);
        let Some(row) = rows.iter_mut().find(|row| row.id == id) else {
            return Ok(false);
        };
        if !row.status.can_transition_to(next) {
            warn!(
                event_id = id,
                from = row.status.as_str(),
                to = next.as_str(),
                "Illegal outbox status transition refused"
            );
            return Ok(false);
        }

        let now = Utc::now();
        row.status = next;
        apply(row, now);
        row.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_pending(&self, limit: u32) -> AppResult<Vec<OutboxRow>> {
        self.check_reads()?;

        let mut rows: Vec<_> = lock(&self.rows)
            .iter()
            .filter(|row| row.status.is_pollable())
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn update_status(&self, id: &str, status: OutboxStatus) -> AppResult<bool> {
        self.transition(id, status, |row, now| {
            match status {
                OutboxStatus::Processing => row.last_attempt_at = Some(now),
                OutboxStatus::Published | OutboxStatus::Completed => row.processed_at = Some(now),
                OutboxStatus::Pending | OutboxStatus::Failed => {}
            }
        })
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> AppResult<bool> {
        self.transition(id, OutboxStatus::Failed, |row, _| {
            row.error_message = Some(reason.to_string());
        })
    }

    async fn increment_attempts(&self, id: &str) -> AppResult<bool> {
        self.update(id, |row, now| {
            row.attempts += 1;
            row.last_attempt_at = Some(now);
        })
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.check_writes()?;

        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|row| !(row.status.is_success_terminal() && row.created_at < cutoff));
        Ok((before - rows.len()) as u64)
    }

    async fn ping(&self) -> AppResult<()> {
        self.check_reads()
    }
}

// ============ 消息代理 ============

/// 内存消息代理：记录所有确认的消息，可注入失败与延迟
#[derive(Default)]
pub struct InMemoryMessageSink {
    sent: Mutex<Vec<OutboundMessage>>,
    fail_always: AtomicBool,
    failures_remaining: AtomicU32,
    failing_topics: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    flushed: AtomicBool,
}

impl InMemoryMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来 `n` 次发送失败
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// 所有发送都失败
    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// 发往指定 topic 的消息全部失败
    pub fn fail_topic(&self, topic: impl Into<String>) {
        lock(&self.failing_topics).push(topic.into());
    }

    /// 连通性检查失败开关
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// 每次发送前等待（用于超时测试）
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<OutboundMessage> {
        lock(&self.sent)
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn was_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    fn take_failure(&self, topic: &str) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        if lock(&self.failing_topics).iter().any(|t| t == topic) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageSink for InMemoryMessageSink {
    async fn send(&self, message: &OutboundMessage) -> AppResult<()> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure(&message.topic) {
            return Err(AppError::broker(format!(
                "Message to {} was not acknowledged",
                message.topic
            )));
        }

        lock(&self.sent).push(message.clone());
        Ok(())
    }

    async fn check(&self) -> AppResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::broker("no brokers available"));
        }
        Ok(())
    }

    fn flush(&self, _timeout: Duration) {
        self.flushed.store(true, Ordering::SeqCst);
    }
}

// ============ 数据源连接 ============

/// 按数据源名称返回预置的内存存储；未注册的数据源视为不可达
#[derive(Default)]
pub struct InMemoryConnector {
    stores: HashMap<String, Arc<InMemoryOutboxStore>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, source: impl Into<String>, store: Arc<InMemoryOutboxStore>) -> Self {
        self.stores.insert(source.into(), store);
        self
    }

    /// 某个数据源被尝试连接的次数
    pub fn attempts(&self, source: &str) -> u32 {
        lock(&self.attempts).get(source).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SourceConnector for InMemoryConnector {
    async fn connect(&self, source: &SourceConfig) -> AppResult<Arc<dyn OutboxStore>> {
        *lock(&self.attempts).entry(source.name.clone()).or_default() += 1;

        match self.stores.get(&source.name) {
            Some(store) => Ok(store.clone() as Arc<dyn OutboxStore>),
            None => Err(AppError::database(format!(
                "could not connect to {}:{}",
                source.host, source.port
            ))),
        }
    }
}
