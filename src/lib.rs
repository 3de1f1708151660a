//! registrar - SDK heartbeat ingestion and application announcement
//!
//! Client SDKs send periodic heartbeats identifying their application and
//! instance. The pipeline coalesces them in memory, persists them in bulk on
//! a fixed interval, and emits exactly one "application created" event the
//! first time each application is seen.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`ingest`] - Heartbeat validation and the coalescing buffer
//! - [`scheduler`] - Flush and announcement jobs and their timers
//! - [`storage`] - Application, instance and event stores (memory, SQLite, PostgreSQL)
//! - [`pipeline`] - Wires buffer, jobs and stores together
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use registrar::config::Config;
//! use registrar::models::ClientRegistration;
//! use registrar::pipeline::Pipeline;
//! use registrar::storage::Stores;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let stores = Stores::open(&config.storage).await?;
//!     let mut pipeline = Pipeline::new(config.pipeline, stores);
//!     pipeline.start();
//!
//!     pipeline.register_heartbeat(&ClientRegistration::new("billing", "pod-1"), "10.0.0.1")?;
//!
//!     pipeline.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, PipelineConfig, StorageBackend, StorageConfig};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::ingest::{HeartbeatBuffer, RegistrationError, RegistrationService};
    pub use crate::models::{AnnouncementEvent, ApplicationRecord, ClientRegistration, EventType};
    pub use crate::pipeline::Pipeline;
    pub use crate::scheduler::{Job, TickOutcome};
    pub use crate::storage::{ApplicationStore, EventSink, InstanceStore, Stores};
}

// Direct re-exports for convenience
pub use models::{ApplicationRecord, ClientRegistration};
pub use pipeline::Pipeline;
