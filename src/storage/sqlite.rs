//! SQLite store implementation
//!
//! One connection backs all three collaborator roles. Calls run on the
//! blocking thread pool so scheduler ticks never stall the async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use super::{
    ApplicationStore, BatchWriter, EventSink, InstanceStore, SinkError, StoreError, StoreResult,
};
use crate::models::{
    AnnouncementEvent, ApplicationRecord, ApplicationUpsert, EventType, InstanceRecord,
    SdkMetadata,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS client_applications (
        app_name TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        announced INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_client_applications_announced
        ON client_applications(announced);

    CREATE TABLE IF NOT EXISTS client_instances (
        app_name TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        source_address TEXT NOT NULL,
        started_at TEXT NOT NULL,
        reporting_interval_secs INTEGER NOT NULL,
        last_seen_at TEXT NOT NULL,
        metadata TEXT NOT NULL,
        PRIMARY KEY (app_name, instance_id)
    );

    CREATE TABLE IF NOT EXISTS events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        type TEXT NOT NULL,
        app_name TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_by_user_id INTEGER NOT NULL,
        occurred_at TEXT NOT NULL,
        payload TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
"#;

/// SQLite-backed application store, instance store and event sink
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::unavailable("sqlite.open", e.to_string()))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::unavailable("sqlite.open", e.to_string()))?;

        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| StoreError::unavailable("sqlite.open", e.to_string()))?;
        // Enable WAL mode so several processes can share the file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::unavailable("sqlite.open", e.to_string()))?;

        let store = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory database (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::unavailable("sqlite.open", e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::unavailable("sqlite.create_schema", e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::unavailable(operation, "connection mutex poisoned"))?;
            f(&mut guard).map_err(|e| match e {
                rusqlite::Error::FromSqlConversionFailure(..) => {
                    StoreError::invalid_data(operation, e.to_string())
                }
                other => StoreError::unavailable(operation, other.to_string()),
            })
        })
        .await
        .map_err(|e| StoreError::unavailable(operation, e.to_string()))?
    }
}

// ============================================================================
// Row decoding
// ============================================================================

// Fixed-width text, so `ORDER BY` on the column is chronological
fn timestamp_text(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn to_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn application_from_row(row: &Row<'_>) -> rusqlite::Result<ApplicationRecord> {
    Ok(ApplicationRecord {
        app_name: row.get(0)?,
        created_at: timestamp(row, 1)?,
        updated_at: timestamp(row, 2)?,
        announced: row.get::<_, i64>(3)? != 0,
        last_seen_metadata: json_column::<SdkMetadata>(row, 4)?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<InstanceRecord> {
    Ok(InstanceRecord {
        app_name: row.get(0)?,
        instance_id: row.get(1)?,
        source_address: row.get(2)?,
        started_at: timestamp(row, 3)?,
        reporting_interval_secs: row.get::<_, i64>(4)?.max(0) as u64,
        last_seen_at: timestamp(row, 5)?,
        metadata: json_column(row, 6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AnnouncementEvent> {
    let id: String = row.get(0)?;
    let ty: String = row.get(1)?;
    let event_type = EventType::parse(&ty).ok_or_else(|| {
        conversion_error(1, std::io::Error::new(std::io::ErrorKind::InvalidData, ty.clone()))
    })?;

    Ok(AnnouncementEvent {
        id: id.parse::<Uuid>().map_err(|e| conversion_error(0, e))?,
        event_type,
        app_name: row.get(2)?,
        created_by: row.get(3)?,
        created_by_user_id: row.get(4)?,
        occurred_at: timestamp(row, 5)?,
        payload: json_column(row, 6)?,
    })
}

const APPLICATION_COLUMNS: &str = "app_name, created_at, updated_at, announced, metadata";

// ============================================================================
// Writes
// ============================================================================

fn upsert_applications(tx: &Transaction<'_>, applications: &[ApplicationUpsert]) -> rusqlite::Result<()> {
    let now = timestamp_text(&Utc::now());
    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO client_applications (app_name, created_at, updated_at, announced, metadata)
        VALUES (?1, ?2, ?2, 0, ?3)
        ON CONFLICT(app_name) DO UPDATE SET
            updated_at = excluded.updated_at,
            metadata = excluded.metadata
        "#,
    )?;
    for app in applications {
        stmt.execute(params![app.app_name, now, to_json(&app.metadata)?])?;
    }
    Ok(())
}

fn upsert_instances(tx: &Transaction<'_>, instances: &[InstanceRecord]) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO client_instances
            (app_name, instance_id, source_address, started_at,
             reporting_interval_secs, last_seen_at, metadata)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(app_name, instance_id) DO UPDATE SET
            source_address = excluded.source_address,
            started_at = excluded.started_at,
            reporting_interval_secs = excluded.reporting_interval_secs,
            last_seen_at = excluded.last_seen_at,
            metadata = excluded.metadata
        "#,
    )?;
    for instance in instances {
        stmt.execute(params![
            instance.app_name,
            instance.instance_id,
            instance.source_address,
            timestamp_text(&instance.started_at),
            instance.reporting_interval_secs as i64,
            timestamp_text(&instance.last_seen_at),
            to_json(&instance.metadata)?,
        ])?;
    }
    Ok(())
}

// ============================================================================
// Trait implementations
// ============================================================================

#[async_trait]
impl BatchWriter for SqliteStore {
    async fn write_batch(
        &self,
        instances: &[InstanceRecord],
        applications: &[ApplicationUpsert],
    ) -> StoreResult<()> {
        let instances = instances.to_vec();
        let applications = applications.to_vec();
        self.with_conn("batch.write", move |conn| {
            let tx = conn.transaction()?;
            upsert_instances(&tx, &instances)?;
            upsert_applications(&tx, &applications)?;
            tx.commit()
        })
        .await
    }
}

#[async_trait]
impl ApplicationStore for SqliteStore {
    async fn upsert_many(&self, applications: &[ApplicationUpsert]) -> StoreResult<()> {
        let applications = applications.to_vec();
        self.with_conn("applications.upsert_many", move |conn| {
            let tx = conn.transaction()?;
            upsert_applications(&tx, &applications)?;
            tx.commit()
        })
        .await
    }

    async fn find_unannounced(&self) -> StoreResult<Vec<ApplicationRecord>> {
        self.with_conn("applications.find_unannounced", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {APPLICATION_COLUMNS} FROM client_applications
                 WHERE announced = 0 ORDER BY created_at, app_name"
            ))?;
            let rows = stmt.query_map([], application_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn try_mark_announced(&self, app_name: &str) -> StoreResult<bool> {
        let app_name = app_name.to_string();
        self.with_conn("applications.try_mark_announced", move |conn| {
            let changed = conn.execute(
                "UPDATE client_applications SET announced = 1, updated_at = ?2
                 WHERE app_name = ?1 AND announced = 0",
                params![app_name, timestamp_text(&Utc::now())],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn get(&self, app_name: &str) -> StoreResult<Option<ApplicationRecord>> {
        let app_name = app_name.to_string();
        self.with_conn("applications.get", move |conn| {
            conn.query_row(
                &format!("SELECT {APPLICATION_COLUMNS} FROM client_applications WHERE app_name = ?1"),
                params![app_name],
                application_from_row,
            )
            .optional()
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<ApplicationRecord>> {
        self.with_conn("applications.list", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {APPLICATION_COLUMNS} FROM client_applications ORDER BY app_name"
            ))?;
            let rows = stmt.query_map([], application_from_row)?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn upsert_many(&self, instances: &[InstanceRecord]) -> StoreResult<()> {
        let instances = instances.to_vec();
        self.with_conn("instances.upsert_many", move |conn| {
            let tx = conn.transaction()?;
            upsert_instances(&tx, &instances)?;
            tx.commit()
        })
        .await
    }

    async fn list_for_application(&self, app_name: &str) -> StoreResult<Vec<InstanceRecord>> {
        let app_name = app_name.to_string();
        self.with_conn("instances.list_for_application", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT app_name, instance_id, source_address, started_at,
                        reporting_interval_secs, last_seen_at, metadata
                 FROM client_instances WHERE app_name = ?1 ORDER BY instance_id",
            )?;
            let rows = stmt.query_map(params![app_name], instance_from_row)?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl EventSink for SqliteStore {
    async fn append(&self, event: &AnnouncementEvent) -> Result<(), SinkError> {
        let event = event.clone();
        self.with_conn("events.append", move |conn| {
            conn.execute(
                "INSERT INTO events (id, type, app_name, created_by, created_by_user_id, occurred_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id.to_string(),
                    event.event_type.as_str(),
                    event.app_name,
                    event.created_by,
                    event.created_by_user_id,
                    timestamp_text(&event.occurred_at),
                    to_json(&event.payload)?,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(SinkError::from)
    }

    async fn list(&self, event_type: Option<EventType>) -> Result<Vec<AnnouncementEvent>, SinkError> {
        self.with_conn("events.list", move |conn| {
            let base = "SELECT id, type, app_name, created_by, created_by_user_id, occurred_at, payload FROM events";
            match event_type {
                Some(ty) => {
                    let mut stmt = conn.prepare(&format!("{base} WHERE type = ?1 ORDER BY seq"))?;
                    let rows = stmt.query_map(params![ty.as_str()], event_from_row)?;
                    rows.collect()
                }
                None => {
                    let mut stmt = conn.prepare(&format!("{base} ORDER BY seq"))?;
                    let rows = stmt.query_map([], event_from_row)?;
                    rows.collect()
                }
            }
        })
        .await
        .map_err(SinkError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn upsert(name: &str) -> ApplicationUpsert {
        ApplicationUpsert {
            app_name: name.to_string(),
            metadata: SdkMetadata {
                environment: "production".to_string(),
                strategies: vec!["default".to_string()],
                ..Default::default()
            },
        }
    }

    fn instance(app: &str, id: &str, address: &str) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            app_name: app.to_string(),
            instance_id: id.to_string(),
            source_address: address.to_string(),
            started_at: now,
            reporting_interval_secs: 15,
            last_seen_at: now,
            metadata: SdkMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_application_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();

        ApplicationStore::upsert_many(&store, &[upsert("billing"), upsert("search")])
            .await
            .unwrap();
        assert_eq!(store.find_unannounced().await.unwrap().len(), 2);

        assert!(store.try_mark_announced("billing").await.unwrap());
        assert!(!store.try_mark_announced("billing").await.unwrap());

        let pending = store.find_unannounced().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].app_name, "search");

        let billing = store.get("billing").await.unwrap().unwrap();
        assert!(billing.announced);
        assert_eq!(billing.last_seen_metadata.environment, "production");
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at_and_flag() {
        let store = SqliteStore::in_memory().unwrap();
        ApplicationStore::upsert_many(&store, &[upsert("billing")]).await.unwrap();
        let first = store.get("billing").await.unwrap().unwrap();
        store.try_mark_announced("billing").await.unwrap();

        ApplicationStore::upsert_many(&store, &[upsert("billing")]).await.unwrap();
        let second = store.get("billing").await.unwrap().unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.announced);
        assert_eq!(ApplicationStore::list(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_instance_upsert_replaces_row() {
        let store = SqliteStore::in_memory().unwrap();

        InstanceStore::upsert_many(&store, &[instance("billing", "pod-1", "10.0.0.1")])
            .await
            .unwrap();
        InstanceStore::upsert_many(&store, &[instance("billing", "pod-1", "10.0.0.2")])
            .await
            .unwrap();

        let rows = store.list_for_application("billing").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_address, "10.0.0.2");
        assert_eq!(rows[0].reporting_interval_secs, 15);
    }

    #[tokio::test]
    async fn test_event_append_and_list() {
        let store = SqliteStore::in_memory().unwrap();
        ApplicationStore::upsert_many(&store, &[upsert("billing")]).await.unwrap();
        let app = store.get("billing").await.unwrap().unwrap();
        let event = AnnouncementEvent::application_created(&app, "tester", 7).unwrap();

        store.append(&event).await.unwrap();

        let events = EventSink::list(&store, Some(EventType::ApplicationCreated))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
        assert_eq!(events[0].created_by_user_id, 7);
        assert_eq!(events[0].payload["appName"], "billing");
    }

    #[tokio::test]
    async fn test_write_batch_persists_both_roles() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .write_batch(&[instance("billing", "pod-1", "10.0.0.1")], &[upsert("billing")])
            .await
            .unwrap();

        assert_eq!(store.list_for_application("billing").await.unwrap().len(), 1);
        assert_eq!(store.find_unannounced().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_batch_rolls_back_instances_when_applications_fail() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE client_applications")
            .unwrap();

        let err = store
            .write_batch(&[instance("billing", "pod-1", "10.0.0.1")], &[upsert("billing")])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert!(store.list_for_application("billing").await.unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let whole = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let instants = [
            whole,
            whole + chrono::Duration::nanoseconds(1),
            whole + chrono::Duration::milliseconds(500),
            whole + chrono::Duration::seconds(1),
        ];

        let texts: Vec<String> = instants.iter().map(timestamp_text).collect();

        assert!(texts.windows(2).all(|w| w[0] < w[1]));
        assert!(texts.iter().all(|t| t.len() == texts[0].len()));
        let parsed = DateTime::parse_from_rfc3339(&texts[1]).unwrap().with_timezone(&Utc);
        assert_eq!(parsed, instants[1]);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("registrar.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            ApplicationStore::upsert_many(&store, &[upsert("billing")]).await.unwrap();
            assert!(store.try_mark_announced("billing").await.unwrap());
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.find_unannounced().await.unwrap().is_empty());
        assert!(!reopened.try_mark_announced("billing").await.unwrap());
    }

    #[tokio::test]
    async fn test_two_handles_race_on_announce() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registrar.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();
        ApplicationStore::upsert_many(&a, &[upsert("billing")]).await.unwrap();

        let (ra, rb) = tokio::join!(a.try_mark_announced("billing"), b.try_mark_announced("billing"));

        let wins = [ra.unwrap(), rb.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }
}
