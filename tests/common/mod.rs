//! Common test utilities

use std::time::Duration;

use registrar::config::PipelineConfig;
use registrar::models::ClientRegistration;

/// Registration with the fields a real SDK sends
pub fn registration(app: &str, instance: &str) -> ClientRegistration {
    ClientRegistration {
        sdk_version: Some("unleash-client-node:5.0.0".to_string()),
        strategies: vec!["default".to_string(), "gradualRollout".to_string()],
        interval: 10_000,
        description: Some(format!("{app} service")),
        ..ClientRegistration::new(app, instance)
    }
}

/// Timers slow enough that only manual ticks run during a test
pub fn manual_config() -> PipelineConfig {
    PipelineConfig::builder()
        .flush_interval(Duration::from_secs(3600))
        .announcement_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
}

/// Timers fast enough to observe within a test
#[allow(dead_code)]
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::builder()
        .flush_interval(Duration::from_millis(10))
        .announcement_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}
