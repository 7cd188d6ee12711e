//! Kafka Producer
//!
//! 实现 `MessageSink`：每条消息等待 broker 确认后返回

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use relay_errors::{AppError, AppResult};
use relay_ports::{MessageSink, OutboundMessage};
use tracing::{debug, warn};

use crate::config::ProducerConfig;

/// Kafka 消息发送端
#[derive(Clone)]
pub struct KafkaMessageSink {
    producer: FutureProducer,
    timeout: Duration,
    metadata_timeout: Duration,
}

impl KafkaMessageSink {
    /// 从完整配置创建
    pub fn new(config: &ProducerConfig) -> AppResult<Self> {
        let mut client_config = ClientConfig::new();

        for (key, value) in config.to_client_config_entries() {
            client_config.set(&key, &value);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| AppError::broker(format!("Failed to create Kafka producer: {}", e)))?;

        Ok(Self {
            producer,
            timeout: config.request_timeout,
            metadata_timeout: Duration::from_secs(10),
        })
    }

    /// 从 broker 地址创建
    pub fn from_brokers(brokers: &str) -> AppResult<Self> {
        Self::new(&ProducerConfig::new(brokers))
    }

    /// 设置元数据查询超时（连通性检查使用）
    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    fn owned_headers(message: &OutboundMessage) -> OwnedHeaders {
        message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

#[async_trait]
impl MessageSink for KafkaMessageSink {
    async fn send(&self, message: &OutboundMessage) -> AppResult<()> {
        let record = FutureRecord::to(&message.topic)
            .key(message.key.as_str())
            .payload(message.payload.as_slice())
            .headers(Self::owned_headers(message));

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| {
                AppError::broker(format!("Failed to publish to {}: {}", message.topic, e))
            })?;

        debug!(topic = %message.topic, key = %message.key, "Message acknowledged");
        Ok(())
    }

    async fn check(&self) -> AppResult<()> {
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;

        // fetch_metadata 是阻塞调用
        let broker_count = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| AppError::internal(format!("Kafka health check task failed: {}", e)))?
        .map_err(|e| AppError::broker(format!("Kafka health check failed: {}", e)))?;

        if broker_count == 0 {
            return Err(AppError::broker("Kafka metadata returned no brokers"));
        }

        debug!(brokers = broker_count, "Kafka health check passed");
        Ok(())
    }

    fn flush(&self, timeout: Duration) {
        match self.producer.flush(Timeout::After(timeout)) {
            Ok(()) => debug!("Kafka producer flushed"),
            Err(e) => {
                warn!(error = %e, in_flight = self.producer.in_flight_count(), "Kafka producer flush incomplete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    fn message() -> OutboundMessage {
        OutboundMessage {
            topic: "auth-service.user-registered.v1".to_string(),
            key: "e1".to_string(),
            headers: vec![
                ("event-type".to_string(), "UserRegistered".to_string()),
                ("event-id".to_string(), "e1".to_string()),
            ],
            payload: br#"{"eventId":"e1"}"#.to_vec(),
        }
    }

    #[test]
    fn test_owned_headers() {
        let headers = KafkaMessageSink::owned_headers(&message());
        assert_eq!(headers.count(), 2);

        let first = headers.get(0);
        assert_eq!(first.key, "event-type");
        assert_eq!(first.value, Some(b"UserRegistered".as_slice()));
    }

    #[tokio::test]
    #[ignore] // 需要 Kafka 实例
    async fn test_send_and_check() {
        let sink = KafkaMessageSink::from_brokers("localhost:9092").unwrap();
        sink.check().await.unwrap();
        sink.send(&message()).await.unwrap();
        sink.flush(Duration::from_secs(5));
    }
}
