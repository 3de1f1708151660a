//! Tests for config module

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use registrar::config::{Config, StorageBackend};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_toml_readable() {
    let config = Config::from_file(Path::new("config.toml")).expect("config.toml should parse");

    assert!(config.validate().is_ok());
    assert_eq!(config.pipeline.flush_interval(), Duration::from_secs(5));
    assert_eq!(config.pipeline.announcement_interval(), Duration::from_secs(20));
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.pipeline.system_user_id, -1337);
}

#[test]
fn test_from_file_with_postgres_backend() {
    let file = write_config(
        r#"
        [storage]
        backend = "postgres"
        postgres_url = "postgresql://registrar@db/registrar"
        pool_size = 4
        "#,
    );

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.storage.backend, StorageBackend::Postgres);
    assert_eq!(config.storage.pool_size, 4);
    assert_eq!(config.pipeline.flush_interval_ms, 5000);
}

#[test]
fn test_invalid_intervals_fail_validation() {
    let file = write_config(
        r#"
        [pipeline]
        flush_interval_ms = 10000
        announcement_interval_ms = 1000
        "#,
    );

    let config = Config::from_file(file.path()).unwrap();
    let err = config.validate().unwrap_err();

    assert!(err.to_string().contains("announcement_interval_ms"));
}

#[test]
fn test_zero_pool_size_fails_validation() {
    let file = write_config("[storage]\npool_size = 0\n");

    let config = Config::from_file(file.path()).unwrap();

    assert!(config.validate().is_err());
}

#[test]
fn test_malformed_file_reports_path() {
    let file = write_config("[pipeline\nflush_interval_ms = ");

    let err = Config::from_file(file.path()).unwrap_err();

    assert!(err.to_string().contains("Failed to parse TOML config file"));
}

#[test]
fn test_missing_file() {
    assert!(Config::from_file(Path::new("does/not/exist.toml")).is_err());
}

// The only test that touches the process environment
#[test]
fn test_env_overrides() {
    std::env::set_var("REGISTRAR_FLUSH_INTERVAL_MS", "250");
    std::env::set_var("REGISTRAR_ANNOUNCE_INTERVAL_MS", "1000");
    std::env::set_var("REGISTRAR_STORAGE", "memory");
    std::env::set_var("REGISTRAR_LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();

    std::env::remove_var("REGISTRAR_FLUSH_INTERVAL_MS");
    std::env::remove_var("REGISTRAR_ANNOUNCE_INTERVAL_MS");
    std::env::remove_var("REGISTRAR_STORAGE");
    std::env::remove_var("REGISTRAR_LOG_FORMAT");

    assert_eq!(config.pipeline.flush_interval_ms, 250);
    assert_eq!(config.pipeline.announcement_interval_ms, 1000);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.logging.format, "json");
    assert!(config.validate().is_ok());
}
