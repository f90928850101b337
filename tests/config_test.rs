use meshrun::config::{DEFAULT_RELAY_ADDR, DEFAULT_SCHEDULER_URL, WorkerConfig, load_worker_config};
use meshrun::error::ConfigError;
use meshrun::protocol::WorkerId;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_worker_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
worker_id: worker-7
scheduler_url: http://10.0.0.5:5000
relay_addr: 10.0.0.5:1337
data_bind: 0.0.0.0:7000
advertise_addr: 10.0.0.9:7000
n_cores: 8
batch_delay_ms: 200
resend_delay_ms: 50
"#
    )
    .unwrap();

    let config = load_worker_config(file.path()).unwrap();
    assert_eq!(config.worker_id, Some(WorkerId::new("worker-7")));
    assert_eq!(config.scheduler_url, "http://10.0.0.5:5000");
    assert_eq!(config.relay_addr, "10.0.0.5:1337");
    assert_eq!(config.advertise_addr, Some("10.0.0.9:7000".parse().unwrap()));
    assert_eq!(config.n_cores, 8);
    assert_eq!(config.batch_delay(), Duration::from_millis(200));
    assert_eq!(config.resend_delay(), Duration::from_millis(50));
    // Unset fields keep their defaults
    assert_eq!(config.heartbeat_interval(), Duration::from_millis(5000));
}

#[test]
fn test_defaults_are_valid() {
    let config = WorkerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.relay_addr, DEFAULT_RELAY_ADDR);
    assert_eq!(config.scheduler_url, DEFAULT_SCHEDULER_URL);
    assert!(config.resend_delay() < config.batch_delay());
    assert!(config.n_cores >= 1);
}

#[test]
fn test_resend_must_be_shorter_than_batch_delay() {
    let err = WorkerConfig::from_yaml_str("batch_delay_ms: 100\nresend_delay_ms: 100\n").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::ResendNotShorter {
            resend_ms: 100,
            batch_ms: 100
        }
    ));
}

#[test]
fn test_zero_intervals_rejected() {
    let err = WorkerConfig::from_yaml_str("heartbeat_interval_ms: 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::ZeroInterval("heartbeat_interval_ms")));
}

#[test]
fn test_wildcard_bind_needs_advertise_addr() {
    let err = WorkerConfig::from_yaml_str("data_bind: 0.0.0.0:7000\n").unwrap_err();
    assert!(matches!(err, ConfigError::MissingAdvertiseAddr(_)));
}

#[test]
fn test_missing_file_mentions_path() {
    let err = load_worker_config("/nonexistent/worker.yaml").unwrap_err();
    assert!(format!("{:#}", err).contains("/nonexistent/worker.yaml"));
}

#[test]
fn test_malformed_yaml_is_reported() {
    let err = WorkerConfig::from_yaml_str("n_cores: [1, 2").unwrap_err();
    assert!(matches!(err, ConfigError::Yaml(_)));
}
