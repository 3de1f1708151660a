//! PostgreSQL store implementation
//!
//! Intended for deployments where several pipeline processes share one
//! database. The announced flip is a single conditional `UPDATE`, so at most
//! one process ever wins it for a given application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{
    Config as PgConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Transaction,
};
use tokio_postgres::types::Json;
use tokio_postgres::{NoTls, Row};

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
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        announced BOOLEAN NOT NULL DEFAULT FALSE,
        metadata JSONB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_client_applications_unannounced
        ON client_applications(announced) WHERE announced = FALSE;

    CREATE TABLE IF NOT EXISTS client_instances (
        app_name TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        source_address TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        reporting_interval_secs BIGINT NOT NULL,
        last_seen_at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL,
        PRIMARY KEY (app_name, instance_id)
    );

    CREATE TABLE IF NOT EXISTS events (
        seq BIGSERIAL PRIMARY KEY,
        id UUID NOT NULL UNIQUE,
        type TEXT NOT NULL,
        app_name TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_by_user_id BIGINT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
"#;

const APPLICATION_COLUMNS: &str = "app_name, created_at, updated_at, announced, metadata";

fn unavailable<E: std::fmt::Display>(operation: &'static str) -> impl Fn(E) -> StoreError {
    move |e| StoreError::unavailable(operation, e.to_string())
}

/// PostgreSQL-backed application store, instance store and event sink
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Connect, verify the connection and create the schema
    pub async fn connect(url: &str, pool_size: usize) -> StoreResult<Self> {
        let mut cfg = PgConfig::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(unavailable("postgres.connect"))?;

        let store = Self { pool };
        store.init_schema().await?;

        tracing::info!(pool_size, "PostgreSQL store initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let client = self.pool.get().await.map_err(unavailable("postgres.init_schema"))?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(unavailable("postgres.init_schema"))
    }

    async fn client(&self, operation: &'static str) -> StoreResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(unavailable(operation))
    }
}

fn application_from_row(row: &Row) -> Result<ApplicationRecord, tokio_postgres::Error> {
    let metadata: Json<SdkMetadata> = row.try_get("metadata")?;
    Ok(ApplicationRecord {
        app_name: row.try_get("app_name")?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
        announced: row.try_get("announced")?,
        last_seen_metadata: metadata.0,
    })
}

fn instance_from_row(row: &Row) -> Result<InstanceRecord, tokio_postgres::Error> {
    let metadata: Json<SdkMetadata> = row.try_get("metadata")?;
    Ok(InstanceRecord {
        app_name: row.try_get("app_name")?,
        instance_id: row.try_get("instance_id")?,
        source_address: row.try_get("source_address")?,
        started_at: row.try_get("started_at")?,
        reporting_interval_secs: row.try_get::<_, i64>("reporting_interval_secs")?.max(0) as u64,
        last_seen_at: row.try_get("last_seen_at")?,
        metadata: metadata.0,
    })
}

fn event_from_row(row: &Row) -> StoreResult<AnnouncementEvent> {
    let decode = unavailable("events.list");
    let ty: String = row.try_get("type").map_err(&decode)?;
    let event_type = EventType::parse(&ty)
        .ok_or_else(|| StoreError::invalid_data("events.list", format!("unknown event type '{ty}'")))?;
    let payload: Json<serde_json::Value> = row.try_get("payload").map_err(&decode)?;

    Ok(AnnouncementEvent {
        id: row.try_get("id").map_err(&decode)?,
        event_type,
        app_name: row.try_get("app_name").map_err(&decode)?,
        created_by: row.try_get("created_by").map_err(&decode)?,
        created_by_user_id: row.try_get("created_by_user_id").map_err(&decode)?,
        occurred_at: row.try_get("occurred_at").map_err(&decode)?,
        payload: payload.0,
    })
}

async fn upsert_applications(
    tx: &Transaction<'_>,
    applications: &[ApplicationUpsert],
    op: &'static str,
) -> StoreResult<()> {
    let stmt = tx
        .prepare_cached(
            r#"
            INSERT INTO client_applications (app_name, created_at, updated_at, announced, metadata)
            VALUES ($1, $2, $2, FALSE, $3)
            ON CONFLICT (app_name) DO UPDATE SET
                updated_at = EXCLUDED.updated_at,
                metadata = EXCLUDED.metadata
            "#,
        )
        .await
        .map_err(unavailable(op))?;

    let now = Utc::now();
    for app in applications {
        tx.execute(&stmt, &[&app.app_name, &now, &Json(&app.metadata)])
            .await
            .map_err(unavailable(op))?;
    }
    Ok(())
}

async fn upsert_instances(
    tx: &Transaction<'_>,
    instances: &[InstanceRecord],
    op: &'static str,
) -> StoreResult<()> {
    let stmt = tx
        .prepare_cached(
            r#"
            INSERT INTO client_instances
                (app_name, instance_id, source_address, started_at,
                 reporting_interval_secs, last_seen_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (app_name, instance_id) DO UPDATE SET
                source_address = EXCLUDED.source_address,
                started_at = EXCLUDED.started_at,
                reporting_interval_secs = EXCLUDED.reporting_interval_secs,
                last_seen_at = EXCLUDED.last_seen_at,
                metadata = EXCLUDED.metadata
            "#,
        )
        .await
        .map_err(unavailable(op))?;

    for instance in instances {
        let interval = instance.reporting_interval_secs as i64;
        tx.execute(
            &stmt,
            &[
                &instance.app_name,
                &instance.instance_id,
                &instance.source_address,
                &instance.started_at,
                &interval,
                &instance.last_seen_at,
                &Json(&instance.metadata),
            ],
        )
        .await
        .map_err(unavailable(op))?;
    }
    Ok(())
}

#[async_trait]
impl BatchWriter for PostgresStore {
    async fn write_batch(
        &self,
        instances: &[InstanceRecord],
        applications: &[ApplicationUpsert],
    ) -> StoreResult<()> {
        const OP: &str = "batch.write";
        let mut client = self.client(OP).await?;
        let tx = client.transaction().await.map_err(unavailable(OP))?;
        upsert_instances(&tx, instances, OP).await?;
        upsert_applications(&tx, applications, OP).await?;
        tx.commit().await.map_err(unavailable(OP))
    }
}

#[async_trait]
impl ApplicationStore for PostgresStore {
    async fn upsert_many(&self, applications: &[ApplicationUpsert]) -> StoreResult<()> {
        const OP: &str = "applications.upsert_many";
        let mut client = self.client(OP).await?;
        let tx = client.transaction().await.map_err(unavailable(OP))?;
        upsert_applications(&tx, applications, OP).await?;
        tx.commit().await.map_err(unavailable(OP))
    }

    async fn find_unannounced(&self) -> StoreResult<Vec<ApplicationRecord>> {
        const OP: &str = "applications.find_unannounced";
        let client = self.client(OP).await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {APPLICATION_COLUMNS} FROM client_applications
                     WHERE announced = FALSE ORDER BY created_at, app_name"
                ),
                &[],
            )
            .await
            .map_err(unavailable(OP))?;

        rows.iter()
            .map(|row| application_from_row(row).map_err(|e| StoreError::invalid_data(OP, e.to_string())))
            .collect()
    }

    async fn try_mark_announced(&self, app_name: &str) -> StoreResult<bool> {
        const OP: &str = "applications.try_mark_announced";
        let client = self.client(OP).await?;
        let changed = client
            .execute(
                "UPDATE client_applications SET announced = TRUE, updated_at = NOW()
                 WHERE app_name = $1 AND announced = FALSE",
                &[&app_name],
            )
            .await
            .map_err(unavailable(OP))?;
        Ok(changed == 1)
    }

    async fn get(&self, app_name: &str) -> StoreResult<Option<ApplicationRecord>> {
        const OP: &str = "applications.get";
        let client = self.client(OP).await?;
        let row = client
            .query_opt(
                &format!("SELECT {APPLICATION_COLUMNS} FROM client_applications WHERE app_name = $1"),
                &[&app_name],
            )
            .await
            .map_err(unavailable(OP))?;

        row.as_ref()
            .map(application_from_row)
            .transpose()
            .map_err(|e| StoreError::invalid_data(OP, e.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<ApplicationRecord>> {
        const OP: &str = "applications.list";
        let client = self.client(OP).await?;
        let rows = client
            .query(
                &format!("SELECT {APPLICATION_COLUMNS} FROM client_applications ORDER BY app_name"),
                &[],
            )
            .await
            .map_err(unavailable(OP))?;

        rows.iter()
            .map(|row| application_from_row(row).map_err(|e| StoreError::invalid_data(OP, e.to_string())))
            .collect()
    }
}

#[async_trait]
impl InstanceStore for PostgresStore {
    async fn upsert_many(&self, instances: &[InstanceRecord]) -> StoreResult<()> {
        const OP: &str = "instances.upsert_many";
        let mut client = self.client(OP).await?;
        let tx = client.transaction().await.map_err(unavailable(OP))?;
        upsert_instances(&tx, instances, OP).await?;
        tx.commit().await.map_err(unavailable(OP))
    }

    async fn list_for_application(&self, app_name: &str) -> StoreResult<Vec<InstanceRecord>> {
        const OP: &str = "instances.list_for_application";
        let client = self.client(OP).await?;
        let rows = client
            .query(
                "SELECT app_name, instance_id, source_address, started_at,
                        reporting_interval_secs, last_seen_at, metadata
                 FROM client_instances WHERE app_name = $1 ORDER BY instance_id",
                &[&app_name],
            )
            .await
            .map_err(unavailable(OP))?;

        rows.iter()
            .map(|row| instance_from_row(row).map_err(|e| StoreError::invalid_data(OP, e.to_string())))
            .collect()
    }
}

#[async_trait]
impl EventSink for PostgresStore {
    async fn append(&self, event: &AnnouncementEvent) -> Result<(), SinkError> {
        const OP: &str = "events.append";
        let client = self.client(OP).await?;
        client
            .execute(
                "INSERT INTO events (id, type, app_name, created_by, created_by_user_id, occurred_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &event.id,
                    &event.event_type.as_str(),
                    &event.app_name,
                    &event.created_by,
                    &event.created_by_user_id,
                    &event.occurred_at,
                    &Json(&event.payload),
                ],
            )
            .await
            .map_err(unavailable(OP))?;
        Ok(())
    }

    async fn list(&self, event_type: Option<EventType>) -> Result<Vec<AnnouncementEvent>, SinkError> {
        const OP: &str = "events.list";
        let client = self.client(OP).await?;
        let base = "SELECT id, type, app_name, created_by, created_by_user_id, occurred_at, payload FROM events";
        let rows = match event_type {
            Some(ty) => {
                client
                    .query(&format!("{base} WHERE type = $1 ORDER BY seq"), &[&ty.as_str()])
                    .await
            }
            None => client.query(&format!("{base} ORDER BY seq"), &[]).await,
        }
        .map_err(unavailable(OP))?;

        Ok(rows.iter().map(event_from_row).collect::<StoreResult<Vec<_>>>()?)
    }
}
