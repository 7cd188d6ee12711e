//! 数据源连接

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_adapter_postgres::{PostgresConfig, PostgresOutboxStore, create_pool};
use relay_config::SourceConfig;
use relay_errors::AppResult;
use relay_ports::OutboxStore;

/// 为一个配置好的数据源建立 outbox 存储
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, source: &SourceConfig) -> AppResult<Arc<dyn OutboxStore>>;
}

/// PostgreSQL 连接器：每个数据源独立的连接池
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    connect_timeout: Duration,
}

impl PostgresConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for PostgresConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl SourceConnector for PostgresConnector {
    async fn connect(&self, source: &SourceConfig) -> AppResult<Arc<dyn OutboxStore>> {
        let config = PostgresConfig::new(
            &source.host,
            source.port,
            &source.username,
            source.password.clone(),
            &source.database,
        )
        .with_max_connections(source.max_connections)
        .with_connect_timeout(self.connect_timeout);

        let pool = create_pool(&config).await?;
        Ok(Arc::new(PostgresOutboxStore::new(pool, &source.table)))
    }
}
