//! PostgreSQL Outbox 存储
//!
//! 表由业务服务预先创建，列：
//! `id, type, payload, metadata, status, attempts, created_at, updated_at,
//! processed_at, last_attempt_at, error_message`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_errors::{AppError, AppResult};
use relay_ports::{OutboxRow, OutboxStatus, OutboxStore};
use sqlx::PgPool;

/// `'pending', 'failed'` 形式的状态列表
fn status_list(statuses: &[OutboxStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 预先拼好的 SQL（表名在配置阶段已校验）
///
/// 状态迁移都是条件更新：只有当前状态允许迁移到目标状态时才会命中
#[derive(Debug, Clone)]
struct OutboxQueries {
    fetch_pending: String,
    mark_processing: String,
    mark_terminal: String,
    mark_failed: String,
    increment_attempts: String,
    delete_terminal: String,
}

impl OutboxQueries {
    fn new(table: &str) -> Self {
        let pollable = status_list(&OutboxStatus::POLLABLE);
        let terminal = status_list(&OutboxStatus::SUCCESS_TERMINAL);
        let claimable = status_list(&OutboxStatus::sources_of(OutboxStatus::Processing));
        let finishable = status_list(&OutboxStatus::sources_of(OutboxStatus::Published));
        let failable = status_list(&OutboxStatus::sources_of(OutboxStatus::Failed));

        Self {
            fetch_pending: format!(
                r#"
                SELECT id::text AS id, type AS event_type, payload, metadata, status, attempts,
                       last_attempt_at, processed_at, created_at, updated_at, error_message
                FROM {table}
                WHERE status IN ({pollable})
                ORDER BY created_at ASC
                LIMIT $1
                "#
            ),
            mark_processing: format!(
                "UPDATE {table} SET status = 'processing', last_attempt_at = NOW(), updated_at = NOW() \
                 WHERE id::text = $1 AND status IN ({claimable})"
            ),
            mark_terminal: format!(
                "UPDATE {table} SET status = $2, processed_at = NOW(), updated_at = NOW() \
                 WHERE id::text = $1 AND status IN ({finishable})"
            ),
            mark_failed: format!(
                "UPDATE {table} SET status = 'failed', error_message = COALESCE($2, error_message), updated_at = NOW() \
                 WHERE id::text = $1 AND status IN ({failable})"
            ),
            increment_attempts: format!(
                "UPDATE {table} SET attempts = attempts + 1, last_attempt_at = NOW(), updated_at = NOW() WHERE id::text = $1"
            ),
            delete_terminal: format!(
                "DELETE FROM {table} WHERE status IN ({terminal}) AND created_at < $1"
            ),
        }
    }
}

/// PostgreSQL Outbox 存储
pub struct PostgresOutboxStore {
    pool: PgPool,
    table: String,
    queries: OutboxQueries,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            pool,
            queries: OutboxQueries::new(&table),
            table,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn execute_update(&self, sql: &str, id: &str, args: &[Option<&str>]) -> AppResult<bool> {
        let mut query = sqlx::query(sql).bind(id);
        for arg in args {
            query = query.bind(*arg);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to update outbox row {}: {}", id, e)))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn fetch_pending(&self, limit: u32) -> AppResult<Vec<OutboxRow>> {
        let records = sqlx::query_as::<_, OutboxRecord>(&self.queries.fetch_pending)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to get pending events: {}", e)))?;

        records.into_iter().map(OutboxRow::try_from).collect()
    }

    async fn update_status(&self, id: &str, status: OutboxStatus) -> AppResult<bool> {
        match status {
            OutboxStatus::Processing => {
                self.execute_update(&self.queries.mark_processing, id, &[])
                    .await
            }
            OutboxStatus::Published | OutboxStatus::Completed => {
                self.execute_update(&self.queries.mark_terminal, id, &[Some(status.as_str())])
                    .await
            }
            OutboxStatus::Failed => {
                self.execute_update(&self.queries.mark_failed, id, &[None]).await
            }
            // 没有任何状态可以回到 pending
            OutboxStatus::Pending => Ok(false),
        }
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> AppResult<bool> {
        self.execute_update(&self.queries.mark_failed, id, &[Some(reason)])
            .await
    }

    async fn increment_attempts(&self, id: &str) -> AppResult<bool> {
        self.execute_update(&self.queries.increment_attempts, id, &[])
            .await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(&self.queries.delete_terminal)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to cleanup old events: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> AppResult<()> {
        crate::check_connection(&self.pool).await
    }
}

// ============ 数据行映射 ============

#[derive(sqlx::FromRow)]
struct OutboxRecord {
    id: String,
    event_type: String,
    payload: serde_json::Value,
    metadata: Option<serde_json::Value>,
    status: String,
    attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<OutboxRecord> for OutboxRow {
    type Error = AppError;

    fn try_from(record: OutboxRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            status: record.status.parse()?,
            attempts: u32::try_from(record.attempts).unwrap_or(0),
            updated_at: record.updated_at.unwrap_or(record.created_at),
            id: record.id,
            event_type: record.event_type,
            payload: record.payload,
            metadata: record.metadata,
            last_attempt_at: record.last_attempt_at,
            processed_at: record.processed_at,
            created_at: record.created_at,
            error_message: record.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_use_table_and_status_sets() {
        let queries = OutboxQueries::new("public.outbox_events");

        assert!(queries.fetch_pending.contains("FROM public.outbox_events"));
        assert!(queries.fetch_pending.contains("status IN ('pending', 'failed')"));
        assert!(queries.fetch_pending.contains("ORDER BY created_at ASC"));
        assert!(queries.delete_terminal.contains("status IN ('published', 'completed')"));
        assert!(!queries.delete_terminal.contains("failed"));
    }

    #[test]
    fn test_transitions_are_conditional() {
        let queries = OutboxQueries::new("outbox_events");

        assert!(queries.mark_processing.ends_with("status IN ('pending', 'failed')"));
        assert!(
            queries
                .mark_terminal
                .ends_with("status IN ('pending', 'processing', 'failed')")
        );
        assert!(
            queries
                .mark_failed
                .ends_with("status IN ('pending', 'processing', 'failed')")
        );
        assert!(queries.mark_failed.contains("COALESCE($2, error_message)"));
    }

    #[test]
    fn test_record_conversion() {
        let now = Utc::now();
        let record = OutboxRecord {
            id: "e1".to_string(),
            event_type: "UserCreated".to_string(),
            payload: serde_json::json!({ "id": 1 }),
            metadata: None,
            status: "failed".to_string(),
            attempts: -1,
            last_attempt_at: None,
            processed_at: None,
            created_at: now,
            updated_at: None,
            error_message: Some("timeout".to_string()),
        };

        let row = OutboxRow::try_from(record).unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.updated_at, now);
    }

    #[tokio::test]
    #[ignore] // 需要 PostgreSQL 实例
    async fn test_fetch_pending_live() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PostgresOutboxStore::new(pool, "outbox_events");

        let rows = store.fetch_pending(10).await.unwrap();
        assert!(rows.iter().all(|row| row.status.is_pollable()));
        assert!(rows.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }
}
