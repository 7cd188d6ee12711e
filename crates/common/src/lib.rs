//! relay-common - 通用组件
//!
//! 断路器注册表、连接重试、聚合健康状态

pub mod circuit_breaker;
pub mod health;
pub mod retry;

pub use circuit_breaker::*;
pub use health::*;
pub use retry::*;
