//! 事件信封
//!
//! 每次发布时由 outbox 行新建，不落库

use chrono::{DateTime, SecondsFormat, Utc};
use relay_errors::{AppError, AppResult, ErrorDetails};
use relay_ports::OutboxRow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 信封版本
pub const EVENT_VERSION: &str = "1.0.0";

/// DLQ 信封的事件类型
pub const DLQ_EVENT_TYPE: &str = "DLQEvent";

/// 消息头名称
pub mod headers {
    pub const EVENT_TYPE: &str = "event-type";
    pub const EVENT_VERSION: &str = "event-version";
    pub const EVENT_ID: &str = "event-id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SOURCE_SERVICE: &str = "source-service";
}

/// 线上事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub event_version: String,
    /// 发布时间（不是行的创建时间）
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub metadata: Map<String, Value>,
}

impl EventEnvelope {
    /// 由 outbox 行构建信封
    ///
    /// 行的 metadata 合并进信封 metadata；`sourceService` 与 `originalCreatedAt`
    /// 由中继写入，不会被行内同名字段覆盖。metadata 不是 JSON 对象时返回校验错误。
    pub fn from_row(row: &OutboxRow, source: &str, published_at: DateTime<Utc>) -> AppResult<Self> {
        let mut metadata = match &row.metadata {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(AppError::validation(format!(
                    "Outbox row {} metadata must be a JSON object, got {}",
                    row.id,
                    json_kind(other)
                )));
            }
        };

        metadata.insert("sourceService".to_string(), Value::String(source.to_string()));
        metadata.insert(
            "originalCreatedAt".to_string(),
            Value::String(row.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        Ok(Self {
            event_id: row.id.clone(),
            event_type: row.event_type.clone(),
            event_version: EVENT_VERSION.to_string(),
            timestamp: published_at,
            payload: row.payload.clone(),
            metadata,
        })
    }

    /// 发往代理的消息头
    pub fn headers(&self, source: &str) -> Vec<(String, String)> {
        vec![
            (headers::EVENT_TYPE.to_string(), self.event_type.clone()),
            (headers::EVENT_VERSION.to_string(), self.event_version.clone()),
            (headers::EVENT_ID.to_string(), self.event_id.clone()),
            (
                headers::TIMESTAMP.to_string(),
                self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (headers::SOURCE_SERVICE.to_string(), source.to_string()),
        ]
    }

    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// DLQ 失败元数据
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureMetadata {
    pub service: String,
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
}

/// DLQ 信封载荷
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqPayload {
    pub original_event: EventEnvelope,
    pub error: ErrorDetails,
    pub failure: FailureMetadata,
}

/// 构建 DLQ 信封：类型为 `DLQEvent`，载荷包裹原始信封、错误与失败元数据
pub fn dlq_envelope(
    original: &EventEnvelope,
    error: &AppError,
    failure: FailureMetadata,
    published_at: DateTime<Utc>,
) -> AppResult<EventEnvelope> {
    let mut metadata = Map::new();
    metadata.insert(
        "sourceService".to_string(),
        Value::String(failure.service.clone()),
    );
    metadata.insert(
        "originalEventId".to_string(),
        Value::String(original.event_id.clone()),
    );
    metadata.insert(
        "originalEventType".to_string(),
        Value::String(original.event_type.clone()),
    );

    let payload = serde_json::to_value(DlqPayload {
        original_event: original.clone(),
        error: error.to_details(),
        failure,
    })?;

    Ok(EventEnvelope {
        event_id: Uuid::new_v4().to_string(),
        event_type: DLQ_EVENT_TYPE.to_string(),
        event_version: EVENT_VERSION.to_string(),
        timestamp: published_at,
        payload,
        metadata,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row() -> OutboxRow {
        OutboxRow::pending("e1", "UserRegistered", json!({ "userId": "u-1" }))
            .with_created_at(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
    }

    #[test]
    fn test_from_row() {
        let now = Utc::now();
        let envelope = EventEnvelope::from_row(
            &row().with_metadata(json!({ "traceId": "t-1", "sourceService": "spoofed" })),
            "auth-service",
            now,
        )
        .unwrap();

        assert_eq!(envelope.event_id, "e1");
        assert_eq!(envelope.event_type, "UserRegistered");
        assert_eq!(envelope.event_version, "1.0.0");
        assert_eq!(envelope.timestamp, now);
        assert_eq!(envelope.payload, json!({ "userId": "u-1" }));
        assert_eq!(envelope.metadata["traceId"], "t-1");
        assert_eq!(envelope.metadata["sourceService"], "auth-service");
        assert_eq!(envelope.metadata["originalCreatedAt"], "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_from_row_rejects_non_object_metadata() {
        let err = EventEnvelope::from_row(&row().with_metadata(json!([1, 2])), "auth-service", Utc::now())
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // null 等同于没有 metadata
        assert!(EventEnvelope::from_row(&row().with_metadata(Value::Null), "auth-service", Utc::now()).is_ok());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let envelope = EventEnvelope::from_row(&row(), "auth-service", Utc::now()).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("eventId").is_some());
        assert!(value.get("eventType").is_some());
        assert!(value.get("eventVersion").is_some());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_headers() {
        let envelope = EventEnvelope::from_row(&row(), "auth-service", Utc::now()).unwrap();
        let headers = envelope.headers("auth-service");
        let names: Vec<_> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["event-type", "event-version", "event-id", "timestamp", "source-service"]
        );
        assert!(headers.contains(&("event-id".to_string(), "e1".to_string())));
    }

    #[test]
    fn test_dlq_envelope() {
        let original = EventEnvelope::from_row(&row(), "auth-service", Utc::now()).unwrap();
        let last_attempt_at = Utc::now();
        let dlq = dlq_envelope(
            &original,
            &AppError::broker("message timed out"),
            FailureMetadata {
                service: "auth-service".to_string(),
                attempts: 3,
                last_attempt_at,
            },
            Utc::now(),
        )
        .unwrap();

        assert_eq!(dlq.event_type, DLQ_EVENT_TYPE);
        assert_ne!(dlq.event_id, original.event_id);
        assert_eq!(dlq.payload["originalEvent"]["eventId"], "e1");
        assert_eq!(dlq.payload["error"]["kind"], "broker");
        assert_eq!(dlq.payload["error"]["message"], "Broker error: message timed out");
        assert_eq!(dlq.payload["failure"]["service"], "auth-service");
        assert_eq!(dlq.payload["failure"]["attempts"], 3);
        assert_eq!(dlq.metadata["originalEventId"], "e1");
    }
}
