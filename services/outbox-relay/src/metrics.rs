//! Prometheus 指标
//!
//! 通过 `metrics` 门面记录；导出由 `relay-telemetry` 安装的记录器负责

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use relay_common::{BreakerState, ContextId};
use relay_ports::{RelayObserver, RelayOutcome};

/// 基于 `metrics` 宏的观测实现
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl MetricsObserver {
    fn state_value(state: BreakerState) -> f64 {
        match state {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl RelayObserver for MetricsObserver {
    fn record_event(&self, source: &str, event_type: &str, outcome: RelayOutcome, topic: &str) {
        let labels = [
            ("source", source.to_string()),
            ("event_type", event_type.to_string()),
            ("status", outcome.as_str().to_string()),
            ("topic", topic.to_string()),
        ];

        counter!("outbox_events_relayed_total", &labels).increment(1);
    }

    fn record_dlq(&self, source: &str, event_type: &str) {
        let labels = [
            ("source", source.to_string()),
            ("event_type", event_type.to_string()),
        ];

        counter!("outbox_dlq_events_total", &labels).increment(1);
    }

    fn record_breaker_transition(&self, context: &ContextId, from: BreakerState, to: BreakerState) {
        let context = context.to_string();
        let labels = [
            ("context", context.clone()),
            ("from", from.as_str().to_string()),
            ("to", to.as_str().to_string()),
        ];

        counter!("circuit_breaker_transitions_total", &labels).increment(1);
        gauge!("circuit_breaker_state", "context" => context).set(Self::state_value(to));
    }

    fn record_queue_depth(&self, source: &str, depth: usize) {
        gauge!("outbox_queue_depth", "source" => source.to_string()).set(depth as f64);
    }

    fn record_poll_duration(&self, source: &str, duration: Duration) {
        histogram!("outbox_poll_duration_ms", "source" => source.to_string())
            .record(duration.as_secs_f64() * 1000.0);
    }

    fn record_cleanup(&self, source: &str, deleted: u64) {
        counter!("outbox_events_cleaned_total", "source" => source.to_string()).increment(deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_state_values_are_ordered_by_severity() {
        assert!(
            MetricsObserver::state_value(BreakerState::Closed)
                < MetricsObserver::state_value(BreakerState::HalfOpen)
        );
        assert!(
            MetricsObserver::state_value(BreakerState::HalfOpen)
                < MetricsObserver::state_value(BreakerState::Open)
        );
    }

    fn line<'a>(rendered: &'a str, metric: &str) -> &'a str {
        rendered
            .lines()
            .find(|line| line.starts_with(metric))
            .unwrap_or_else(|| panic!("{} not rendered:\n{}", metric, rendered))
    }

    #[test]
    fn test_observer_records_relay_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let observer = MetricsObserver;

        metrics::with_local_recorder(&recorder, || {
            observer.record_event(
                "auth-service",
                "UserRegistered",
                RelayOutcome::Published,
                "auth-service.user-registered.v1",
            );
            observer.record_dlq("auth-service", "UserRegistered");
            observer.record_breaker_transition(
                &ContextId::Broker,
                BreakerState::Closed,
                BreakerState::Open,
            );
            observer.record_queue_depth("auth-service", 7);
            observer.record_cleanup("auth-service", 3);
        });

        let rendered = handle.render();

        let relayed = line(&rendered, "outbox_events_relayed_total{");
        assert!(relayed.contains(r#"status="published""#));
        assert!(relayed.contains(r#"topic="auth-service.user-registered.v1""#));
        assert!(relayed.ends_with(" 1"));

        assert!(line(&rendered, "outbox_dlq_events_total{").ends_with(" 1"));
        assert!(line(&rendered, "circuit_breaker_transitions_total{").contains(r#"to="open""#));
        assert!(line(&rendered, "circuit_breaker_state{").ends_with(" 2"));
        assert!(line(&rendered, "outbox_queue_depth{").ends_with(" 7"));
        assert!(line(&rendered, "outbox_events_cleaned_total{").ends_with(" 3"));
    }
}
