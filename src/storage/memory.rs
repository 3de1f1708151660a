//! In-memory store implementations
//!
//! Useful for tests and single-node runs without a database. Several
//! pipelines may share one instance through an `Arc` to simulate separate
//! processes racing on the same store. Each store can be switched into an
//! unavailable state to exercise failure handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    ApplicationStore, EventSink, InstanceStore, SinkError, StoreError, StoreResult,
};
use crate::models::{
    AnnouncementEvent, ApplicationRecord, ApplicationUpsert, EventType, InstanceKey,
    InstanceRecord,
};

// ============================================================================
// Applications
// ============================================================================

/// In-memory application registry
#[derive(Default)]
pub struct MemoryApplicationStore {
    rows: RwLock<HashMap<String, ApplicationRecord>>,
    unavailable: AtomicBool,
}

impl MemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(operation, "application store offline"));
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl ApplicationStore for MemoryApplicationStore {
    async fn upsert_many(&self, applications: &[ApplicationUpsert]) -> StoreResult<()> {
        self.check("applications.upsert_many")?;
        let now = Utc::now();
        let mut rows = self.rows.write().await;

        for app in applications {
            rows.entry(app.app_name.clone())
                .and_modify(|row| {
                    row.updated_at = now;
                    row.last_seen_metadata = app.metadata.clone();
                })
                .or_insert_with(|| ApplicationRecord {
                    app_name: app.app_name.clone(),
                    created_at: now,
                    updated_at: now,
                    announced: false,
                    last_seen_metadata: app.metadata.clone(),
                });
        }

        Ok(())
    }

    async fn find_unannounced(&self) -> StoreResult<Vec<ApplicationRecord>> {
        self.check("applications.find_unannounced")?;
        let rows = self.rows.read().await;
        let mut pending: Vec<_> = rows.values().filter(|r| !r.announced).cloned().collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.app_name.cmp(&b.app_name))
        });
        Ok(pending)
    }

    async fn try_mark_announced(&self, app_name: &str) -> StoreResult<bool> {
        self.check("applications.try_mark_announced")?;
        let mut rows = self.rows.write().await;

        match rows.get_mut(app_name) {
            Some(row) if !row.announced => {
                row.announced = true;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, app_name: &str) -> StoreResult<Option<ApplicationRecord>> {
        self.check("applications.get")?;
        Ok(self.rows.read().await.get(app_name).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<ApplicationRecord>> {
        self.check("applications.list")?;
        let rows = self.rows.read().await;
        let mut all: Vec<_> = rows.values().cloned().collect();
        all.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        Ok(all)
    }
}

// ============================================================================
// Instances
// ============================================================================

/// In-memory instance registry
#[derive(Default)]
pub struct MemoryInstanceStore {
    rows: RwLock<BTreeMap<InstanceKey, InstanceRecord>>,
    unavailable: AtomicBool,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn upsert_many(&self, instances: &[InstanceRecord]) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(
                "instances.upsert_many",
                "instance store offline",
            ));
        }

        let mut rows = self.rows.write().await;
        for instance in instances {
            let key = InstanceKey::new(instance.app_name.clone(), instance.instance_id.clone());
            rows.insert(key, instance.clone());
        }
        Ok(())
    }

    async fn list_for_application(&self, app_name: &str) -> StoreResult<Vec<InstanceRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| r.app_name == app_name)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Events
// ============================================================================

/// In-memory append-only event log
#[derive(Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<AnnouncementEvent>>,
    unavailable: AtomicBool,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, event: &AnnouncementEvent) -> Result<(), SinkError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable {
                reason: "event log offline".to_string(),
            });
        }
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn list(&self, event_type: Option<EventType>) -> Result<Vec<AnnouncementEvent>, SinkError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SdkMetadata;

    fn upsert(name: &str, color: &str) -> ApplicationUpsert {
        ApplicationUpsert {
            app_name: name.to_string(),
            metadata: SdkMetadata {
                color: Some(color.to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_announced_flag() {
        let store = MemoryApplicationStore::new();
        store.upsert_many(&[upsert("billing", "red")]).await.unwrap();
        assert!(store.try_mark_announced("billing").await.unwrap());

        store.upsert_many(&[upsert("billing", "blue")]).await.unwrap();

        let row = store.get("billing").await.unwrap().unwrap();
        assert!(row.announced);
        assert_eq!(row.last_seen_metadata.color.as_deref(), Some("blue"));
        assert!(store.find_unannounced().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_try_mark_unknown_application() {
        let store = MemoryApplicationStore::new();
        assert!(!store.try_mark_announced("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryApplicationStore::new();
        store.set_unavailable(true);

        let err = store.find_unannounced().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));

        store.set_unavailable(false);
        assert!(store.find_unannounced().await.is_ok());
    }

    #[tokio::test]
    async fn test_event_sink_unavailable() {
        let sink = MemoryEventSink::new();
        sink.set_unavailable(true);
        let now = Utc::now();
        let app = ApplicationRecord {
            app_name: "billing".to_string(),
            created_at: now,
            updated_at: now,
            announced: true,
            last_seen_metadata: SdkMetadata::default(),
        };
        let event = AnnouncementEvent::application_created(&app, "test", 1).unwrap();

        assert!(sink.append(&event).await.is_err());
        assert!(sink.is_empty().await);
    }
}
