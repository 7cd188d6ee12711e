//! relay-config - 配置加载库
//!
//! 合并顺序：`default.toml` -> `<APP_ENV>.toml` -> `RELAY_` 前缀环境变量（嵌套键用 `__` 分隔）

use std::collections::HashSet;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

/// 使用 `completed` 作为成功终态的数据源；其他数据源使用 `published`
pub const COMPLETED_SOURCE: &str = "auth-service";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 成功终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessStatus {
    Published,
    Completed,
}

/// 数据源（业务服务数据库）配置
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// 服务名，同时用作 topic 命名空间与断路器上下文
    pub name: String,
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub username: String,
    pub password: Secret<String>,
    pub database: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_source_max_connections")]
    pub max_connections: u32,
    /// 显式指定成功终态；缺省时由服务名决定
    #[serde(default)]
    pub success_status: Option<SuccessStatus>,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_table() -> String {
    "outbox_events".to_string()
}

fn default_source_max_connections() -> u32 {
    5
}

impl SourceConfig {
    pub fn success_status(&self) -> SuccessStatus {
        match self.success_status {
            Some(status) => status,
            None if self.name == COMPLETED_SOURCE => SuccessStatus::Completed,
            None => SuccessStatus::Published,
        }
    }
}

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// none / gzip / snappy / lz4 / zstd
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<Secret<String>>,
}

fn default_client_id() -> String {
    "outbox-relay".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

impl KafkaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 轮询配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    /// 重试上限：失败次数达到该值时投递 DLQ
    pub max_retries: u32,
    /// 成功终态行的保留天数
    pub retention_days: u32,
    /// 同一数据源两次成功清理的最小间隔，0（默认）表示每轮都清理
    pub cleanup_interval_secs: u64,
    /// 启动时连接每个数据源的尝试次数
    pub connect_attempts: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            batch_size: 50,
            max_retries: 3,
            retention_days: 7,
            cleanup_interval_secs: 0,
            connect_attempts: 3,
        }
    }
}

impl RelaySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// 断路器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_attempts: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_attempts: 3,
            timeout_ms: 30_000,
        }
    }
}

/// 健康检查 HTTP 服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_app_name() -> String {
    "outbox-relay".to_string()
}

fn default_app_env() -> String {
    "development".to_string()
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let figment = Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("RELAY_").split("__"));

        Self::from_figment(figment)
    }

    /// 从任意 figment 提取并校验
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("at least one source is required".into()));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid("source name must not be empty".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
            if !is_valid_table_name(&source.table) {
                return Err(ConfigError::Invalid(format!(
                    "invalid table name for source {}: {}",
                    source.name, source.table
                )));
            }
        }

        if self.relay.batch_size == 0 {
            return Err(ConfigError::Invalid("relay.batch_size must be positive".into()));
        }
        if self.relay.max_retries == 0 {
            return Err(ConfigError::Invalid("relay.max_retries must be positive".into()));
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.poll_interval_ms must be positive".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be positive".into(),
            ));
        }

        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }
}

/// 表名只允许 `[A-Za-z_][A-Za-z0-9_]*`，可带一级 schema 前缀
pub fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests;
