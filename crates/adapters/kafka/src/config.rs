//! Kafka 生产者配置

use std::str::FromStr;
use std::time::Duration;

use relay_errors::AppError;
use secrecy::{ExposeSecret, Secret};

/// SASL 认证机制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL 配置
#[derive(Debug, Clone)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: String,
    /// 只在生成 librdkafka 配置项时取出
    pub password: Secret<String>,
}

impl SaslConfig {
    pub fn plain(username: impl Into<String>, password: Secret<String>) -> Self {
        Self {
            mechanism: SaslMechanism::Plain,
            username: username.into(),
            password,
        }
    }
}

/// 压缩类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Snappy => "snappy",
            CompressionType::Lz4 => "lz4",
            CompressionType::Zstd => "zstd",
        }
    }
}

impl FromStr for CompressionType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "snappy" => Ok(CompressionType::Snappy),
            "lz4" => Ok(CompressionType::Lz4),
            "zstd" => Ok(CompressionType::Zstd),
            other => Err(AppError::config(format!(
                "Unknown Kafka compression type: {}",
                other
            ))),
        }
    }
}

/// Producer 配置
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Broker 地址列表（逗号分隔）
    pub brokers: String,
    pub client_id: String,
    pub sasl: Option<SaslConfig>,
    pub compression: CompressionType,
    /// 延迟发送时间（用于批量）
    pub linger_ms: u64,
    /// 确认模式：0=不等待，1=leader确认，-1=所有副本确认
    pub acks: i32,
    /// 请求超时，同时作为单条消息的投递超时
    pub request_timeout: Duration,
    pub enable_idempotence: bool,
}

impl ProducerConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: "outbox-relay".to_string(),
            sasl: None,
            compression: CompressionType::default(),
            linger_ms: 5,
            acks: -1,
            request_timeout: Duration::from_secs(30),
            enable_idempotence: false,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_sasl(mut self, sasl: SaslConfig) -> Self {
        self.sasl = Some(sasl);
        self
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idempotence(mut self) -> Self {
        self.enable_idempotence = true;
        self.acks = -1; // 幂等性需要 acks=-1
        self
    }

    /// 转换为 rdkafka ClientConfig 的配置项
    pub fn to_client_config_entries(&self) -> Vec<(String, String)> {
        let timeout_ms = self.request_timeout.as_millis().to_string();

        let mut entries = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            ("client.id".to_string(), self.client_id.clone()),
            (
                "compression.type".to_string(),
                self.compression.as_str().to_string(),
            ),
            ("linger.ms".to_string(), self.linger_ms.to_string()),
            ("acks".to_string(), self.acks.to_string()),
            ("request.timeout.ms".to_string(), timeout_ms.clone()),
            ("message.timeout.ms".to_string(), timeout_ms),
        ];

        match &self.sasl {
            Some(sasl) => {
                entries.push(("security.protocol".to_string(), "sasl_plaintext".to_string()));
                entries.push((
                    "sasl.mechanism".to_string(),
                    sasl.mechanism.as_str().to_string(),
                ));
                entries.push(("sasl.username".to_string(), sasl.username.clone()));
                entries.push(("sasl.password".to_string(), sasl.password.expose_secret().clone()));
            }
            None => {
                entries.push(("security.protocol".to_string(), "plaintext".to_string()));
            }
        }

        if self.enable_idempotence {
            entries.push(("enable.idempotence".to_string(), "true".to_string()));
        }

        entries
    }
}
