//! 消息代理发布器
//!
//! 所有发送都经过 `broker` 断路器上下文；失败在这里记录日志后以 `Err` 返回

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_common::{CircuitBreakerRegistry, ContextId};
use relay_errors::{AppError, AppResult};
use relay_event_core::{EventEnvelope, FailureMetadata, dlq_envelope, dlq_topic};
use relay_ports::{MessageSink, OutboundMessage};
use tracing::{debug, error, warn};

/// 代理发布器
#[derive(Clone)]
pub struct BrokerPublisher {
    sink: Arc<dyn MessageSink>,
    breaker: Arc<CircuitBreakerRegistry>,
}

impl BrokerPublisher {
    pub fn new(sink: Arc<dyn MessageSink>, breaker: Arc<CircuitBreakerRegistry>) -> Self {
        Self { sink, breaker }
    }

    /// 发布事件信封；消息 key 为事件 id（即 outbox 行 id）
    pub async fn publish_event(
        &self,
        source: &str,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> AppResult<()> {
        let message = OutboundMessage {
            topic: topic.to_string(),
            key: envelope.event_id.clone(),
            headers: envelope.headers(source),
            payload: envelope.to_bytes()?,
        };

        match self.send(&message).await {
            Ok(()) => {
                debug!(source, topic, event_id = %envelope.event_id, "Event published");
                Ok(())
            }
            Err(e) => {
                warn!(
                    source,
                    topic,
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to publish event"
                );
                Err(e)
            }
        }
    }

    /// 投递到 `<source>.dlq.v1`
    pub async fn publish_to_dlq(
        &self,
        original: &EventEnvelope,
        error: &AppError,
        failure: FailureMetadata,
    ) -> AppResult<()> {
        let source = failure.service.clone();
        let attempts = failure.attempts;
        let topic = dlq_topic(&source);
        let envelope = dlq_envelope(original, error, failure, Utc::now())?;

        let message = OutboundMessage {
            topic: topic.clone(),
            key: original.event_id.clone(),
            headers: envelope.headers(&source),
            payload: envelope.to_bytes()?,
        };

        match self.send(&message).await {
            Ok(()) => {
                warn!(
                    source = %source,
                    topic = %topic,
                    event_id = %original.event_id,
                    attempts,
                    reason = %error,
                    "Event sent to dead letter queue"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    source = %source,
                    topic = %topic,
                    event_id = %original.event_id,
                    error = %e,
                    "Failed to publish event to dead letter queue"
                );
                Err(e)
            }
        }
    }

    /// 代理连通性检查（不经过断路器）
    pub async fn check(&self) -> AppResult<()> {
        self.sink.check().await
    }

    pub fn flush(&self, timeout: Duration) {
        self.sink.flush(timeout);
    }

    async fn send(&self, message: &OutboundMessage) -> AppResult<()> {
        let sink = &self.sink;
        self.breaker
            .execute(&ContextId::Broker, || sink.send(message))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMessageSink;
    use relay_common::{BreakerState, CircuitBreakerConfig};
    use relay_event_core::event_topic;
    use relay_ports::OutboxRow;
    use serde_json::json;

    fn setup(threshold: u32) -> (BrokerPublisher, Arc<InMemoryMessageSink>, Arc<CircuitBreakerRegistry>) {
        let sink = Arc::new(InMemoryMessageSink::new());
        let breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
            half_open_max_attempts: 3,
            timeout: Duration::from_secs(1),
        }));
        (BrokerPublisher::new(sink.clone(), breaker.clone()), sink, breaker)
    }

    fn envelope() -> EventEnvelope {
        let row = OutboxRow::pending("e1", "UserRegistered", json!({ "userId": "u-1" }));
        EventEnvelope::from_row(&row, "auth-service", Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_publish_event() {
        let (publisher, sink, _) = setup(5);
        let topic = event_topic("auth-service", "UserRegistered");

        publisher
            .publish_event("auth-service", &topic, &envelope())
            .await
            .unwrap();

        let sent = sink.sent_to("auth-service.user-registered.v1");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "e1");
        assert_eq!(sent[0].header("event-type"), Some("UserRegistered"));
        assert_eq!(sent[0].header("event-version"), Some("1.0.0"));
        assert_eq!(sent[0].header("source-service"), Some("auth-service"));

        let body: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body["eventId"], "e1");
        assert_eq!(body["payload"]["userId"], "u-1");
    }

    #[tokio::test]
    async fn test_failures_open_broker_breaker() {
        let (publisher, sink, breaker) = setup(2);
        sink.fail_always(true);

        for _ in 0..2 {
            let err = publisher
                .publish_event("auth-service", "t", &envelope())
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Broker(_)));
        }

        assert_eq!(breaker.get_state(&ContextId::Broker), BreakerState::Open);
        assert!(!breaker.can_execute(&ContextId::Broker));

        let err = publisher
            .publish_event("auth-service", "t", &envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CircuitOpen(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_broker_times_out() {
        let (publisher, sink, _) = setup(5);
        sink.set_delay(Some(Duration::from_secs(5)));

        let err = publisher
            .publish_event("auth-service", "t", &envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_publish_to_dlq() {
        let (publisher, sink, _) = setup(5);
        let original = envelope();

        publisher
            .publish_to_dlq(
                &original,
                &AppError::broker("leader not available"),
                FailureMetadata {
                    service: "auth-service".to_string(),
                    attempts: 3,
                    last_attempt_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let sent = sink.sent_to("auth-service.dlq.v1");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "e1");
        assert_eq!(sent[0].header("event-type"), Some("DLQEvent"));

        let body: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body["eventType"], "DLQEvent");
        assert_eq!(body["payload"]["originalEvent"]["eventId"], "e1");
        assert_eq!(body["payload"]["failure"]["attempts"], 3);
        assert!(
            body["payload"]["error"]["message"]
                .as_str()
                .unwrap()
                .contains("leader not available")
        );
    }
}
