use rask_event_forwarder::app::config::{Config, ConfigError, LogFormat, LogLevel, TransportKind};
use rask_event_forwarder::domain::{PriorityId, Urgency};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_test::assert_ok;

const FULL_CONFIG: &str = r#"
endpoint = "https://collector.example.com:9700"
storage_path = "/var/lib/rask/store"
log_level = "debug"
log_format = "json"
transport = "websocket"
enable_compression = true
request_timeout_ms = 5000

[[pipeline.priorities]]
priority = 0
identifier = "realTime"
max_batch_size = 20000
max_time_between_batches = 2000
max_cache_size = 1000000
urgency = "immediate"

[[pipeline.priorities]]
priority = 1
identifier = "bulk"
max_cache_size = 4000000

[pipeline.constraints]
max_request_ack_timeout = 3000
max_retries_per_batch = 5
min_battery_level_percent = 15
flush_on_app_launch = true

[pipeline.classification]
default_priority = "bulk"

[pipeline.classification.events]
purchase = "realTime"

[pipeline.sampling]
default_rate = 50

[pipeline.sampling.overrides]
purchase = 100
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn expect_invalid(content: &str, needle: &str) {
    match Config::from_rask_config_env(content) {
        Err(ConfigError::InvalidConfig(message)) => {
            assert!(message.contains(needle), "{message} lacks {needle}");
        }
        other => panic!("expected InvalidConfig containing '{needle}', got {other:?}"),
    }
}

#[test]
fn test_from_file_reads_every_section() {
    let file = write_config(FULL_CONFIG);
    let config = assert_ok!(Config::from_file(file.path()));

    assert_eq!(config.endpoint_url().unwrap().port(), Some(9700));
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.transport, TransportKind::Websocket);
    assert_eq!(config.request_timeout, Duration::from_secs(5));
    assert!(config.publisher_config().enable_compression);

    let pipeline = &config.pipeline;
    assert_eq!(pipeline.priorities.len(), 2);
    let real_time = pipeline.priority(&PriorityId::from("realTime")).unwrap();
    assert_eq!(real_time.max_batch_size, Some(20_000));
    assert_eq!(
        real_time.max_time_between_batches,
        Some(Duration::from_secs(2))
    );
    assert_eq!(real_time.urgency, Urgency::Immediate);
    let bulk = pipeline.priority(&PriorityId::from("bulk")).unwrap();
    assert_eq!(bulk.urgency, Urgency::Normal);
    assert_eq!(bulk.max_batch_size, None);
    assert_eq!(bulk.max_time_between_batches, None);

    let constraints = &pipeline.constraints;
    assert_eq!(constraints.max_request_ack_timeout, Duration::from_secs(3));
    assert_eq!(constraints.max_retries_per_batch, 5);
    assert!(constraints.flush_on_app_launch);
    // Unset constraints keep their defaults.
    assert_eq!(constraints.max_connection_retries, 30);
    assert_eq!(constraints.connection_retry_duration, Duration::from_secs(3));

    assert_eq!(
        pipeline.classification.events.get("purchase"),
        Some(&PriorityId::from("realTime"))
    );
    assert_eq!(pipeline.sampling.default_rate, 50);
}

#[test]
fn test_defaults_are_valid() {
    let mut config = Config::default();
    assert_ok!(config.post_process());
    assert_ok!(config.validate());
    assert_eq!(config.pipeline.priorities[0].identifier, PriorityId::from("realTime"));
    assert_eq!(config.pipeline.constraints.max_ping_interval, Duration::from_secs(15));
}

#[test]
fn test_invalid_endpoint_is_rejected() {
    let result = Config::from_rask_config_env(r#"endpoint = "not a url""#);
    assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
}

#[test]
fn test_pipeline_validation_errors() {
    expect_invalid(
        r#"
[pipeline]
priorities = []
"#,
        "At least one priority",
    );
    expect_invalid(
        r#"
[[pipeline.priorities]]
identifier = "realTime"
max_cache_size = 10

[[pipeline.priorities]]
identifier = "realTime"
max_cache_size = 10
"#,
        "Duplicate priority",
    );
    expect_invalid(
        r#"
[[pipeline.priorities]]
identifier = "realTime"
max_cache_size = 0
"#,
        "max_cache_size",
    );
    expect_invalid(
        r#"
[pipeline.constraints]
max_request_ack_timeout = 0
"#,
        "max_request_ack_timeout",
    );
    expect_invalid(
        r#"
[pipeline.constraints]
min_battery_level_percent = 120
"#,
        "min_battery_level_percent",
    );
    expect_invalid(
        r#"
[pipeline.classification]
default_priority = "missing"
"#,
        "unknown priority 'missing'",
    );
    expect_invalid(
        r#"
[pipeline.sampling.overrides]
tap = 150
"#,
        "Sampling rate for 'tap'",
    );
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let result = Config::from_rask_config_env("endpoint = ");
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
#[serial]
fn test_from_env_reads_variables() {
    unsafe {
        std::env::remove_var("RASK_CONFIG");
        std::env::remove_var("CONFIG_FILE");
        std::env::set_var("RASK_ENDPOINT", "http://localhost:9700");
        std::env::set_var("LOG_LEVEL", "warn");
        std::env::set_var("RASK_TRANSPORT", "pubsub");
        std::env::set_var("REQUEST_TIMEOUT_MS", "1500");
    }

    let config = Config::from_env();

    unsafe {
        std::env::remove_var("RASK_ENDPOINT");
        std::env::remove_var("LOG_LEVEL");
        std::env::remove_var("RASK_TRANSPORT");
        std::env::remove_var("REQUEST_TIMEOUT_MS");
    }

    let config = assert_ok!(config);
    assert_eq!(config.endpoint, "http://localhost:9700");
    assert_eq!(config.log_level, LogLevel::Warn);
    assert_eq!(config.transport, TransportKind::Pubsub);
    assert_eq!(config.request_timeout, Duration::from_millis(1500));
}

#[test]
#[serial]
fn test_from_env_rejects_unknown_transport() {
    unsafe {
        std::env::remove_var("RASK_CONFIG");
        std::env::set_var("RASK_TRANSPORT", "carrier-pigeon");
    }
    let result = Config::from_env();
    unsafe {
        std::env::remove_var("RASK_TRANSPORT");
    }
    assert!(matches!(result, Err(ConfigError::EnvError(_))));
}

#[test]
#[serial]
fn test_rask_config_takes_precedence() {
    unsafe {
        std::env::set_var(
            "RASK_CONFIG",
            r#"
endpoint = "http://inline:9700"

[pipeline.sampling]
default_rate = 10
"#,
        );
        std::env::set_var("RASK_ENDPOINT", "http://ignored:9700");
    }
    let result = Config::from_env();
    unsafe {
        std::env::remove_var("RASK_CONFIG");
        std::env::remove_var("RASK_ENDPOINT");
    }

    let config = assert_ok!(result);
    assert_eq!(config.endpoint, "http://inline:9700");
    assert_eq!(config.pipeline.sampling.default_rate, 10);
}

#[test]
#[serial]
fn test_config_file_argument_supplies_pipeline() {
    let file = write_config(FULL_CONFIG);
    let config = assert_ok!(Config::from_args([
        "rask-event-forwarder",
        "--endpoint",
        "http://cli:9700",
        "--config-file",
        file.path().to_str().unwrap(),
    ]));

    // Process settings come from the command line, the pipeline from the file.
    assert_eq!(config.endpoint, "http://cli:9700");
    assert_eq!(config.pipeline.priorities.len(), 2);
    assert_eq!(config.pipeline.sampling.default_rate, 50);
}
