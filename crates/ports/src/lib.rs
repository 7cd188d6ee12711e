//! ports - 抽象 trait 层
//!
//! 定义中继依赖的基础设施接口：outbox 存储、消息代理发送端、观测能力

mod message_sink;
mod observer;
mod outbox;

pub use message_sink::*;
pub use observer::*;
pub use outbox::*;
