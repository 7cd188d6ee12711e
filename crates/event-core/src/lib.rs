//! relay-event-core - 事件核心库
//!
//! 线上事件信封、DLQ 信封与 topic 推导

mod envelope;
mod topic;

pub use envelope::*;
pub use topic::*;
