//! Outbox 读取器
//!
//! 每个数据源一个。所有存储错误都在这里记录日志并降级为空值，
//! 错误本身随结果一起返回，由编排器转换为断路器信号。

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use relay_errors::AppError;
use relay_ports::{OutboxRow, OutboxStatus, OutboxStore};
use tracing::{debug, error, info};

/// 读取器操作结果：降级后的值，以及被吞掉的错误（如果有）
#[derive(Debug)]
pub struct StoreOutcome<T> {
    pub value: T,
    pub error: Option<AppError>,
}

impl<T> StoreOutcome<T> {
    fn ok(value: T) -> Self {
        Self { value, error: None }
    }

    fn degraded(value: T, error: AppError) -> Self {
        Self {
            value,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// 单个数据源的 outbox 读取器
#[derive(Clone)]
pub struct OutboxReader {
    source: String,
    store: Arc<dyn OutboxStore>,
}

impl OutboxReader {
    pub fn new(source: impl Into<String>, store: Arc<dyn OutboxStore>) -> Self {
        Self {
            source: source.into(),
            store,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 按创建时间升序读取最多 `limit` 条 pending/failed 行，失败时返回空列表
    pub async fn get_pending_events(&self, limit: u32) -> StoreOutcome<Vec<OutboxRow>> {
        match self.store.fetch_pending(limit).await {
            Ok(rows) => {
                debug!(source = %self.source, count = rows.len(), "Fetched pending outbox events");
                StoreOutcome::ok(rows)
            }
            Err(e) => {
                error!(source = %self.source, error = %e, "Failed to get pending events");
                StoreOutcome::degraded(Vec::new(), e)
            }
        }
    }

    pub async fn mark_as_processing(&self, id: &str) -> StoreOutcome<bool> {
        self.update_status(id, OutboxStatus::Processing).await
    }

    pub async fn mark_as_published(&self, id: &str) -> StoreOutcome<bool> {
        self.update_status(id, OutboxStatus::Published).await
    }

    pub async fn mark_as_completed(&self, id: &str) -> StoreOutcome<bool> {
        self.update_status(id, OutboxStatus::Completed).await
    }

    pub async fn mark_as_failed(&self, id: &str, reason: &str) -> StoreOutcome<bool> {
        let result = self.store.mark_failed(id, reason).await;
        self.flag(id, "mark_as_failed", result)
    }

    pub async fn increment_attempts(&self, id: &str) -> StoreOutcome<bool> {
        let result = self.store.increment_attempts(id).await;
        self.flag(id, "increment_attempts", result)
    }

    /// 删除超过保留期的成功终态行，返回删除数量（出错时为 0）
    pub async fn cleanup_old_events(&self, days_to_keep: u32) -> StoreOutcome<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days_to_keep));

        match self.store.delete_terminal_before(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(source = %self.source, deleted, days_to_keep, "Cleaned up old outbox events");
                }
                StoreOutcome::ok(deleted)
            }
            Err(e) => {
                error!(source = %self.source, error = %e, "Failed to cleanup old events");
                StoreOutcome::degraded(0, e)
            }
        }
    }

    async fn update_status(&self, id: &str, status: OutboxStatus) -> StoreOutcome<bool> {
        let result = self.store.update_status(id, status).await;
        self.flag(id, status.as_str(), result)
    }

    fn flag(&self, id: &str, operation: &str, result: Result<bool, AppError>) -> StoreOutcome<bool> {
        match result {
            Ok(true) => StoreOutcome::ok(true),
            Ok(false) => {
                debug!(source = %self.source, event_id = id, operation, "Outbox row not found");
                StoreOutcome::ok(false)
            }
            Err(e) => {
                error!(source = %self.source, event_id = id, operation, error = %e, "Outbox update failed");
                StoreOutcome::degraded(false, e)
            }
        }
    }
}
