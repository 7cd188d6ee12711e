//! 消息代理发送 trait

use std::time::Duration;

use async_trait::async_trait;
use relay_errors::AppResult;

/// 待发送的消息
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    /// 分区键：同一个 outbox 行 id 总是落在同一分区
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// 按名称查找消息头
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// 消息代理发送端
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// 发送单条消息，等待代理确认
    async fn send(&self, message: &OutboundMessage) -> AppResult<()>;

    /// 代理连通性检查
    async fn check(&self) -> AppResult<()>;

    /// 刷新尚未确认的消息（关闭时调用）
    fn flush(&self, _timeout: Duration) {}
}
