use crate::*;
use figment::Figment;
use figment::providers::{Format, Toml};
use secrecy::{ExposeSecret, Secret};

const SAMPLE: &str = r#"
app_env = "test"

[kafka]
brokers = "localhost:9092"

[relay]
batch_size = 20

[[sources]]
name = "auth-service"
host = "auth-db"
username = "relay"
password = "s3cret"
database = "auth"

[[sources]]
name = "user-service"
host = "user-db"
port = 6432
username = "relay"
password = "s3cret"
database = "users"
table = "public.outbox"
"#;

fn load(toml: &str) -> Result<AppConfig, ConfigError> {
    AppConfig::from_figment(Figment::new().merge(Toml::string(toml)))
}

#[test]
fn test_secret_redaction() {
    let secret = Secret::new("my_secret_password".to_string());
    let debug_output = format!("{:?}", secret);
    assert!(debug_output.contains("Secret([REDACTED"));
    assert!(!debug_output.contains("my_secret_password"));
}

#[test]
fn test_load_with_defaults() {
    let config = load(SAMPLE).unwrap();

    assert_eq!(config.app_name, "outbox-relay");
    assert_eq!(config.relay.batch_size, 20);
    assert_eq!(config.relay.max_retries, 3);
    assert_eq!(config.relay.poll_interval_ms, 5_000);
    assert_eq!(config.relay.retention_days, 7);
    assert_eq!(config.relay.cleanup_interval_secs, 0);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.kafka.client_id, "outbox-relay");

    let auth = &config.sources[0];
    assert_eq!(auth.port, 5432);
    assert_eq!(auth.table, "outbox_events");
    assert_eq!(auth.password.expose_secret(), "s3cret");

    let users = &config.sources[1];
    assert_eq!(users.port, 6432);
    assert_eq!(users.table, "public.outbox");
}

#[test]
fn test_source_config_redaction() {
    let config = load(SAMPLE).unwrap();
    let debug_output = format!("{:?}", config.sources[0]);
    assert!(!debug_output.contains("s3cret"));
}

#[test]
fn test_success_status_per_source() {
    let config = load(SAMPLE).unwrap();
    assert_eq!(config.sources[0].success_status(), SuccessStatus::Completed);
    assert_eq!(config.sources[1].success_status(), SuccessStatus::Published);

    let mut overridden = config.sources[1].clone();
    overridden.success_status = Some(SuccessStatus::Completed);
    assert_eq!(overridden.success_status(), SuccessStatus::Completed);
}

#[test]
fn test_rejects_missing_sources() {
    let err = load("[kafka]\nbrokers = \"localhost:9092\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_rejects_duplicate_sources() {
    let duplicated = format!(
        "{}\n[[sources]]\nname = \"auth-service\"\nhost = \"h\"\nusername = \"u\"\npassword = \"p\"\ndatabase = \"d\"\n",
        SAMPLE
    );
    let err = load(&duplicated).unwrap_err();
    assert!(err.to_string().contains("duplicate source name"));
}

#[test]
fn test_rejects_zero_batch_size() {
    let err = load(&SAMPLE.replace("batch_size = 20", "batch_size = 0")).unwrap_err();
    assert!(err.to_string().contains("batch_size"));
}

#[test]
fn test_table_name_validation() {
    assert!(is_valid_table_name("outbox_events"));
    assert!(is_valid_table_name("public.outbox_events"));
    assert!(!is_valid_table_name("outbox; DROP TABLE users"));
    assert!(!is_valid_table_name("a.b.c"));
    assert!(!is_valid_table_name("1outbox"));
    assert!(!is_valid_table_name(""));
}
