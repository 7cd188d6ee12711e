//! Outbox 数据模型与存储 trait
//!
//! Outbox 行由业务服务在自身事务中写入，中继只读取、更新状态和清理，从不创建。

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Outbox 行状态
///
/// 轮询可见集合为 `{Pending, Failed}`。注意 `Failed` 同时也是超过重试上限、
/// 已经投递到 DLQ 的行的最终标记，因此这些行会在后续每个轮询周期被重新选中、
/// 重新尝试并再次投递 DLQ，直到人工介入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Published,
        OutboxStatus::Completed,
        OutboxStatus::Failed,
    ];

    /// 轮询器选择的状态
    pub const POLLABLE: [OutboxStatus; 2] = [OutboxStatus::Pending, OutboxStatus::Failed];

    /// 成功终态
    pub const SUCCESS_TERMINAL: [OutboxStatus; 2] =
        [OutboxStatus::Published, OutboxStatus::Completed];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Published => "published",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_success_terminal(&self) -> bool {
        Self::SUCCESS_TERMINAL.contains(self)
    }

    pub fn is_pollable(&self) -> bool {
        Self::POLLABLE.contains(self)
    }

    /// 状态迁移是否合法
    ///
    /// 成功终态不再迁移；存储写入失败时编排器会越过认领继续处理，
    /// 所以 `Pending`/`Failed` 也可以直接进入成功终态或 `Failed`。
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        use OutboxStatus::*;

        match (*self, next) {
            (Published | Completed, _) => false,
            (Pending | Failed, Processing) => true,
            (Pending | Processing | Failed, Published | Completed | Failed) => true,
            (_, Pending) | (Processing, Processing) => false,
        }
    }

    /// 可以迁移到 `next` 的所有状态，存储层据此生成条件更新
    pub fn sources_of(next: OutboxStatus) -> Vec<OutboxStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "published" => Ok(OutboxStatus::Published),
            "completed" => Ok(OutboxStatus::Completed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(AppError::validation(format!(
                "Unknown outbox status: {}",
                other
            ))),
        }
    }
}

/// Outbox 行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl OutboxRow {
    /// 新的待发布行（测试与回放工具使用）
    pub fn pending(
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            event_type: event_type.into(),
            payload,
            metadata: None,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
            error_message: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }
}

/// Outbox 存储 trait
///
/// 每个方法对应一条 SQL；错误原样返回，由读取器在边界处降级
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 按创建时间升序读取 `Pending`/`Failed` 行
    async fn fetch_pending(&self, limit: u32) -> AppResult<Vec<OutboxRow>>;

    /// 更新单行状态，返回是否命中
    ///
    /// 进入 `Processing` 时刷新 `last_attempt_at`，进入成功终态时写入 `processed_at`
    async fn update_status(&self, id: &str, status: OutboxStatus) -> AppResult<bool>;

    /// 标记为失败并记录原因
    async fn mark_failed(&self, id: &str, reason: &str) -> AppResult<bool>;

    /// 尝试次数加一
    async fn increment_attempts(&self, id: &str) -> AppResult<bool>;

    /// 删除创建时间早于 `cutoff` 的成功终态行
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// 连通性检查
    async fn ping(&self) -> AppResult<()>;
}
