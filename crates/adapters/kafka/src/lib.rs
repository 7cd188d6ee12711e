//! relay-adapter-kafka - Kafka 适配器
//!
//! 提供消息发送端（带 key 与消息头）、连通性检查与生产者配置（SASL、压缩、幂等）

mod config;
mod producer;

pub use config::*;
pub use producer::*;
