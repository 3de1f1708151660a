//! Store and event sink abstractions
//!
//! The pipeline depends on three collaborators: the application store, the
//! instance store and the event sink. This module defines their contracts as
//! traits so the schedulers can be wired against any backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              FlushJob / AnnouncementJob                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        ApplicationStore, InstanceStore, EventSink           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │     SQLite      │ │   PostgreSQL    │ │    In-memory    │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```
//!
//! The announced flag is the only arbitration point between concurrently
//! running pipelines, so every backend implements
//! [`ApplicationStore::try_mark_announced`] as a single conditional update.

pub mod memory;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};
use crate::models::{
    AnnouncementEvent, ApplicationRecord, ApplicationUpsert, EventType, InstanceRecord,
};

pub use memory::{MemoryApplicationStore, MemoryEventSink, MemoryInstanceStore};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

// ============================================================================
// Errors
// ============================================================================

/// Failures raised by the application and instance stores
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Backend could not complete the operation
    #[error("Store unavailable during '{operation}': {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },

    /// A stored row could not be decoded
    #[error("Invalid stored data during '{operation}': {reason}")]
    InvalidData {
        operation: &'static str,
        reason: String,
    },
}

impl StoreError {
    pub fn unavailable(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            reason: reason.into(),
        }
    }

    pub fn invalid_data(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidData {
            operation,
            reason: reason.into(),
        }
    }
}

/// Failures raised by the event sink
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    /// The underlying store cannot accept the write
    #[error("Event sink unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<StoreError> for SinkError {
    fn from(err: StoreError) -> Self {
        Self::Unavailable {
            reason: err.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Traits
// ============================================================================

/// Canonical registry of known applications
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Insert unknown applications and refresh metadata of known ones.
    ///
    /// Never touches `announced` or `created_at` of an existing row.
    async fn upsert_many(&self, applications: &[ApplicationUpsert]) -> StoreResult<()>;

    /// All rows whose `announced` flag is still false
    async fn find_unannounced(&self) -> StoreResult<Vec<ApplicationRecord>>;

    /// Flip `announced` from false to true.
    ///
    /// Returns true only if this call performed the flip.
    async fn try_mark_announced(&self, app_name: &str) -> StoreResult<bool>;

    async fn get(&self, app_name: &str) -> StoreResult<Option<ApplicationRecord>>;

    async fn list(&self) -> StoreResult<Vec<ApplicationRecord>>;
}

/// Canonical registry of live instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Upsert keyed by (app name, instance id)
    async fn upsert_many(&self, instances: &[InstanceRecord]) -> StoreResult<()>;

    async fn list_for_application(&self, app_name: &str) -> StoreResult<Vec<InstanceRecord>>;
}

/// Append-only domain event log
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &AnnouncementEvent) -> Result<(), SinkError>;

    /// Stored events, optionally filtered by type, oldest first
    async fn list(&self, event_type: Option<EventType>) -> Result<Vec<AnnouncementEvent>, SinkError>;
}

/// Persists one drained flush batch
#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Upsert instance rows and application rows of one batch.
    ///
    /// Database backends write both in a single transaction, so a failed
    /// call leaves no row of the batch behind.
    async fn write_batch(
        &self,
        instances: &[InstanceRecord],
        applications: &[ApplicationUpsert],
    ) -> StoreResult<()>;
}

pub type SharedApplicationStore = Arc<dyn ApplicationStore>;
pub type SharedInstanceStore = Arc<dyn InstanceStore>;
pub type SharedEventSink = Arc<dyn EventSink>;
pub type SharedBatchWriter = Arc<dyn BatchWriter>;

/// Batch writer over two independent stores
///
/// Instances are written first, then applications. The two writes share no
/// transaction: if the application write fails, the batch's instance rows
/// stay written while none of its application rows exist. The next
/// heartbeat of each instance rewrites both.
pub struct SplitBatchWriter {
    applications: SharedApplicationStore,
    instances: SharedInstanceStore,
}

impl SplitBatchWriter {
    pub fn new(applications: SharedApplicationStore, instances: SharedInstanceStore) -> Self {
        Self {
            applications,
            instances,
        }
    }
}

#[async_trait]
impl BatchWriter for SplitBatchWriter {
    async fn write_batch(
        &self,
        instances: &[InstanceRecord],
        applications: &[ApplicationUpsert],
    ) -> StoreResult<()> {
        self.instances.upsert_many(instances).await?;
        self.applications.upsert_many(applications).await
    }
}

/// The collaborators, constructed once at process start
#[derive(Clone)]
pub struct Stores {
    pub applications: SharedApplicationStore,
    pub instances: SharedInstanceStore,
    pub events: SharedEventSink,
    /// Flush path; atomic when one database backs every role
    pub batches: SharedBatchWriter,
}

impl Stores {
    /// Bundle independent stores; flushes go through a [`SplitBatchWriter`]
    pub fn new(
        applications: SharedApplicationStore,
        instances: SharedInstanceStore,
        events: SharedEventSink,
    ) -> Self {
        let batches = Arc::new(SplitBatchWriter::new(
            Arc::clone(&applications),
            Arc::clone(&instances),
        ));
        Self {
            applications,
            instances,
            events,
            batches,
        }
    }

    /// Fresh in-memory stores
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryApplicationStore::new()),
            Arc::new(MemoryInstanceStore::new()),
            Arc::new(MemoryEventSink::new()),
        )
    }

    /// Open the backend selected in `config`
    pub async fn open(config: &StorageConfig) -> StoreResult<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::Sqlite => {
                let store = Arc::new(SqliteStore::open(&config.sqlite_path)?);
                Ok(Self::from_shared(store))
            }
            StorageBackend::Postgres => {
                let store =
                    Arc::new(PostgresStore::connect(&config.postgres_url, config.pool_size).await?);
                Ok(Self::from_shared(store))
            }
        }
    }

    /// Use one backend object for every role, including atomic batch writes
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: ApplicationStore + InstanceStore + EventSink + BatchWriter + 'static,
    {
        Self {
            applications: store.clone(),
            instances: store.clone(),
            events: store.clone(),
            batches: store,
        }
    }
}
