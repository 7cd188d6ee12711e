//! relay-bootstrap - 服务启动骨架
//!
//! 运行时初始化、关闭信号、健康检查与 metrics HTTP 端点

mod health;
mod metrics;
mod runtime;

pub use health::*;
pub use metrics::*;
pub use runtime::*;
