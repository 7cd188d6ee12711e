//! 中继端到端流程测试（内存存储 + 内存代理）

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outbox_relay::memory::{InMemoryConnector, InMemoryMessageSink, InMemoryOutboxStore};
use outbox_relay::{OrchestratorSettings, RelayOrchestrator, RelayState};
use relay_bootstrap::HealthReporter;
use relay_common::{BreakerState, CircuitBreakerConfig, ContextId, RetryConfig};
use relay_config::SourceConfig;
use relay_ports::{NoopObserver, OutboxRow, OutboxStatus};
use secrecy::Secret;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Harness {
    relay: Arc<RelayOrchestrator>,
    sink: Arc<InMemoryMessageSink>,
    auth: Arc<InMemoryOutboxStore>,
    users: Arc<InMemoryOutboxStore>,
}

fn source(name: &str) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        host: "localhost".to_string(),
        port: 5432,
        username: "relay".to_string(),
        password: Secret::new("relay".to_string()),
        database: name.replace('-', "_"),
        table: "outbox_events".to_string(),
        max_connections: 1,
        success_status: None,
    }
}

async fn harness(breaker: CircuitBreakerConfig) -> Harness {
    let sink = Arc::new(InMemoryMessageSink::new());
    let auth = Arc::new(InMemoryOutboxStore::new());
    let users = Arc::new(InMemoryOutboxStore::new());

    let relay = Arc::new(RelayOrchestrator::new(
        OrchestratorSettings {
            max_retries: 3,
            connect_retry: RetryConfig::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            ..OrchestratorSettings::default()
        },
        breaker,
        sink.clone(),
        Arc::new(NoopObserver),
    ));

    let connector = InMemoryConnector::new()
        .with_store("auth-service", auth.clone())
        .with_store("user-service", users.clone());
    relay
        .initialize(&connector, &[source("auth-service"), source("user-service")])
        .await
        .unwrap();

    Harness {
        relay,
        sink,
        auth,
        users,
    }
}

#[tokio::test]
async fn test_auth_service_event_is_completed() {
    let h = harness(CircuitBreakerConfig::default()).await;
    h.auth.insert(OutboxRow::pending(
        "e1",
        "UserRegistered",
        json!({ "userId": "u-1", "email": "a@example.com" }),
    ));

    let report = h.relay.poll_once().await;
    assert_eq!(report.published(), 1);

    let sent = h.sink.sent_to("auth-service.user-registered.v1");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key, "e1");
    assert_eq!(sent[0].header("event-id"), Some("e1"));

    let body: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
    assert_eq!(body["eventType"], "UserRegistered");
    assert_eq!(body["metadata"]["sourceService"], "auth-service");
    assert_eq!(body["payload"]["email"], "a@example.com");

    let row = h.auth.row("e1").unwrap();
    assert_eq!(row.status, OutboxStatus::Completed);
    assert!(row.processed_at.is_some());
}

#[tokio::test]
async fn test_other_sources_use_published() {
    let h = harness(CircuitBreakerConfig::default()).await;
    h.users
        .insert(OutboxRow::pending("u1", "UserCreated", json!({ "id": 7 })));

    h.relay.poll_once().await;

    assert_eq!(h.sink.sent_to("user-service.user-created.v1").len(), 1);
    assert_eq!(h.users.row("u1").unwrap().status, OutboxStatus::Published);
}

#[tokio::test]
async fn test_rows_drain_oldest_first() {
    let h = harness(CircuitBreakerConfig::default()).await;
    let now = Utc::now();
    h.users.insert(
        OutboxRow::pending("second", "UserUpdated", json!({})).with_created_at(now),
    );
    h.users.insert(
        OutboxRow::pending("first", "UserCreated", json!({}))
            .with_created_at(now - chrono::Duration::seconds(30)),
    );

    h.relay.poll_once().await;

    let keys: Vec<_> = h.sink.sent().into_iter().map(|m| m.key).collect();
    assert_eq!(keys, vec!["first", "second"]);
}

#[tokio::test]
async fn test_retry_cap_sends_to_dlq() {
    let h = harness(CircuitBreakerConfig::default()).await;
    h.sink.fail_topic("auth-service.user-registered.v1");
    h.auth
        .insert(OutboxRow::pending("e1", "UserRegistered", json!({ "userId": "u-1" })));

    for expected_attempts in 1..=2 {
        let report = h.relay.poll_once().await;
        assert_eq!(report.dead_lettered(), 0);

        let row = h.auth.row("e1").unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.attempts, expected_attempts);
    }

    let report = h.relay.poll_once().await;
    assert_eq!(report.dead_lettered(), 1);

    let dlq = h.sink.sent_to("auth-service.dlq.v1");
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].key, "e1");

    let body: serde_json::Value = serde_json::from_slice(&dlq[0].payload).unwrap();
    assert_eq!(body["eventType"], "DLQEvent");
    assert_eq!(body["payload"]["originalEvent"]["eventId"], "e1");
    assert_eq!(body["payload"]["originalEvent"]["payload"]["userId"], "u-1");
    assert_eq!(body["payload"]["failure"]["attempts"], 3);
    assert!(
        body["payload"]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not acknowledged")
    );

    let row = h.auth.row("e1").unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempts, 3);
    assert!(row.error_message.is_some());
}

#[tokio::test]
async fn test_failed_rows_are_dead_lettered_again_on_every_poll() {
    let h = harness(CircuitBreakerConfig::default()).await;
    h.sink.fail_topic("auth-service.user-registered.v1");
    h.auth
        .insert(OutboxRow::pending("e1", "UserRegistered", json!({})));

    for _ in 0..4 {
        h.relay.poll_once().await;
    }

    // failed 仍在轮询集合中：第 3 轮与第 4 轮各投递一次 DLQ
    assert_eq!(h.sink.sent_to("auth-service.dlq.v1").len(), 2);
    assert_eq!(h.auth.row("e1").unwrap().attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn test_source_breaker_skips_until_reset() {
    let h = harness(CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_secs(30),
        half_open_max_attempts: 2,
        timeout: Duration::from_secs(5),
    })
    .await;
    h.users
        .insert(OutboxRow::pending("u1", "UserCreated", json!({})));
    h.users.fail_reads(true);

    for _ in 0..2 {
        let report = h.relay.poll_once().await;
        assert!(report.source("user-service").unwrap().fetch_failed);
    }

    let context = ContextId::source("user-service");
    assert_eq!(h.relay.breaker().get_state(&context), BreakerState::Open);

    // 存储恢复后，断路器打开期间仍然跳过，行保持不变
    h.users.fail_reads(false);
    let report = h.relay.poll_once().await;
    assert!(report.source("user-service").unwrap().skipped);
    assert_eq!(h.users.row("u1").unwrap().status, OutboxStatus::Pending);
    assert!(h.sink.sent().is_empty());

    let health = h.relay.health();
    assert_eq!(health.healthy_count(), 1);
    assert!(!health.healthy);

    tokio::time::advance(Duration::from_secs(30)).await;

    let report = h.relay.poll_once().await;
    assert_eq!(report.source("user-service").unwrap().published, 1);
    assert_eq!(h.users.row("u1").unwrap().status, OutboxStatus::Published);
    assert_eq!(h.relay.breaker().get_state(&context), BreakerState::Closed);
    assert!(h.relay.health().healthy);
}

#[tokio::test]
async fn test_sources_are_isolated() {
    let h = harness(CircuitBreakerConfig::default()).await;
    h.auth
        .insert(OutboxRow::pending("e1", "UserRegistered", json!({})));
    h.users
        .insert(OutboxRow::pending("u1", "UserCreated", json!({})));
    h.users.fail_reads(true);

    let report = h.relay.poll_once().await;

    assert!(report.source("user-service").unwrap().fetch_failed);
    assert_eq!(report.source("auth-service").unwrap().published, 1);
    assert_eq!(h.auth.row("e1").unwrap().status, OutboxStatus::Completed);
    assert_eq!(
        h.relay.breaker().failure_count(&ContextId::source("auth-service")),
        0
    );
}

#[tokio::test]
async fn test_cleanup_keeps_non_terminal_rows() {
    let h = harness(CircuitBreakerConfig::default()).await;
    let ancient = Utc::now() - chrono::Duration::days(365);

    for (id, status) in [
        ("pending", OutboxStatus::Pending),
        ("processing", OutboxStatus::Processing),
        ("failed", OutboxStatus::Failed),
        ("published", OutboxStatus::Published),
        ("completed", OutboxStatus::Completed),
    ] {
        let mut row = OutboxRow::pending(id, "UserUpdated", json!({})).with_created_at(ancient);
        row.status = status;
        row.attempts = 5;
        h.users.insert(row);
    }
    // 读取正常但所有发布都失败，保证 pending/failed 行在本轮结束时仍不是终态
    h.sink.fail_topic("user-service.user-updated.v1");

    let report = h.relay.poll_once().await;
    assert_eq!(report.source("user-service").unwrap().cleaned, 2);

    let mut remaining: Vec<_> = h.users.rows().into_iter().map(|row| row.id).collect();
    remaining.sort();
    assert_eq!(remaining, vec!["failed", "pending", "processing"]);
}

#[tokio::test(start_paused = true)]
async fn test_polling_lifecycle() {
    let h = harness(CircuitBreakerConfig::default()).await;
    h.auth
        .insert(OutboxRow::pending("e1", "UserRegistered", json!({})));
    assert_eq!(h.relay.current_state(), RelayState::Initializing);
    assert!(!h.relay.is_ready());

    let shutdown = CancellationToken::new();
    let polling = h.relay.clone().start_polling(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.relay.is_ready());
    assert_eq!(h.auth.row("e1").unwrap().status, OutboxStatus::Completed);

    h.users
        .insert(OutboxRow::pending("u1", "UserCreated", json!({})));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.users.row("u1").unwrap().status, OutboxStatus::Published);

    shutdown.cancel();
    polling.await.unwrap();
    h.relay.shutdown(Duration::from_secs(1)).await;

    assert_eq!(h.relay.current_state(), RelayState::Stopped);
    assert!(h.sink.was_flushed());
}
