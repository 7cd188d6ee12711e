//! outbox-relay - 事务性 outbox 中继
//!
//! 轮询多个业务服务数据库中的 outbox 表，把事件逐条发布到 Kafka：
//! - 每个数据源一个读取器，状态更新失败不会中断批次
//! - 数据源与代理各自一个断路器上下文
//! - 超过重试上限的事件投递到 `<source>.dlq.v1`
//! - 按数据源汇总健康状态，定期清理成功终态行

pub mod connector;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod publisher;
pub mod reader;

pub use connector::{PostgresConnector, SourceConnector};
pub use metrics::MetricsObserver;
pub use orchestrator::*;
pub use publisher::BrokerPublisher;
pub use reader::{OutboxReader, StoreOutcome};
