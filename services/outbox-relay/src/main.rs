//! Outbox Relay - 服务入口

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use outbox_relay::{
    MetricsObserver, OrchestratorSettings, PostgresConnector, RelayOrchestrator, breaker_config,
};
use relay_adapter_kafka::{CompressionType, KafkaMessageSink, ProducerConfig, SaslConfig};
use relay_bootstrap::{HealthServer, MetricsRecorder, cancel_on_shutdown, init_runtime};
use relay_config::{AppConfig, KafkaConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config = AppConfig::load(&config_dir).context("Failed to load configuration")?;
    init_runtime(&config);

    let metrics = MetricsRecorder::install().context("Failed to install Prometheus recorder")?;
    let sink = KafkaMessageSink::new(&producer_config(&config.kafka)?)?;

    let orchestrator = Arc::new(RelayOrchestrator::new(
        OrchestratorSettings::from(&config.relay),
        breaker_config(&config.circuit_breaker),
        Arc::new(sink),
        Arc::new(MetricsObserver),
    ));

    let shutdown = CancellationToken::new();
    cancel_on_shutdown(shutdown.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid health server address")?;
    let health_server = HealthServer::new(orchestrator.clone(), addr).with_metrics(metrics);
    let health_task = tokio::spawn(health_server.serve(shutdown.clone()));

    if let Err(e) = orchestrator
        .initialize(&PostgresConnector::default(), &config.sources)
        .await
    {
        error!(error = %e, "Outbox relay failed to initialize");
        shutdown.cancel();
        let _ = health_task.await;
        return Err(e.into());
    }

    let polling = orchestrator.clone().start_polling(shutdown.clone());
    if let Err(e) = polling.await {
        error!(error = %e, "Polling task terminated abnormally");
    }

    orchestrator.shutdown(FLUSH_TIMEOUT).await;

    match health_task.await {
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task terminated abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Outbox relay exited");
    Ok(())
}

fn producer_config(kafka: &KafkaConfig) -> anyhow::Result<ProducerConfig> {
    let compression: CompressionType = kafka.compression.parse()?;

    let mut config = ProducerConfig::new(&kafka.brokers)
        .with_client_id(&kafka.client_id)
        .with_compression(compression)
        .with_request_timeout(kafka.request_timeout());

    if kafka.enable_idempotence {
        config = config.with_idempotence();
    }

    if let (Some(username), Some(password)) = (&kafka.sasl_username, &kafka.sasl_password) {
        config = config.with_sasl(SaslConfig::plain(username, password.clone()));
    }

    Ok(config)
}
