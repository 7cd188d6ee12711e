//! relay-errors - 统一错误处理
//!
//! 错误按来源分类：存储、消息代理、超时、断路器、处理、配置

use serde::Serialize;
use thiserror::Error;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn circuit_open(context: impl Into<String>) -> Self {
        Self::CircuitOpen(context.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// 稳定的错误类别名称，用于 DLQ 载荷与断路器日志
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Broker(_) => "broker",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Validation(_) => "validation",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// 是否为可恢复的瞬时错误
    ///
    /// 存储、代理、超时与断路器打开都属于瞬时故障，下个轮询周期可能自愈；
    /// 校验与配置错误重试也不会改变结果
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Broker(_) | Self::Timeout(_) | Self::CircuitOpen(_)
        )
    }

    /// 转换为可序列化的错误描述
    pub fn to_details(&self) -> ErrorDetails {
        ErrorDetails {
            kind: self.kind(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON encoding failed: {}", err))
    }
}

/// 错误描述（写入 DLQ 信封）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetails {
    pub kind: &'static str,
    pub message: String,
    pub recoverable: bool,
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_recoverable() {
        assert_eq!(AppError::database("down").kind(), "database");
        assert!(AppError::database("down").is_recoverable());
        assert!(AppError::timeout("publish").is_recoverable());
        assert!(AppError::circuit_open("broker").is_recoverable());
        assert!(!AppError::validation("bad metadata").is_recoverable());
        assert!(!AppError::config("no sources").is_recoverable());
    }

    #[test]
    fn test_error_details() {
        let details = AppError::broker("leader not available").to_details();
        assert_eq!(details.kind, "broker");
        assert_eq!(details.message, "Broker error: leader not available");
        assert!(details.recoverable);
    }
}
