// Core data structures for the registration pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actor name recorded on events emitted by the pipeline itself
pub const SYSTEM_ACTOR: &str = "registrar-system";

/// User id reserved for the system actor
pub const SYSTEM_USER_ID: i64 = -1337;

fn default_environment() -> String {
    String::from("default")
}

/// Heartbeat body sent by a client SDK
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub instance_id: String,
    pub sdk_version: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub strategies: Vec<String>,
    pub started: Option<DateTime<Utc>>,
    /// Reporting interval in milliseconds
    #[serde(default)]
    pub interval: u64,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub url: Option<String>,
}

impl ClientRegistration {
    /// Create a registration with only the identity fields set
    pub fn new(app_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            instance_id: instance_id.into(),
            environment: default_environment(),
            ..Default::default()
        }
    }

    /// Opaque SDK metadata carried by this heartbeat
    pub fn metadata(&self) -> SdkMetadata {
        SdkMetadata {
            sdk_version: self.sdk_version.clone(),
            environment: self.environment.clone(),
            strategies: self.strategies.clone(),
            icon: self.icon.clone(),
            description: self.description.clone(),
            color: self.color.clone(),
            url: self.url.clone(),
        }
    }
}

/// SDK-reported metadata mirrored onto applications and instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SdkMetadata {
    pub sdk_version: Option<String>,
    pub environment: String,
    #[serde(default)]
    pub strategies: Vec<String>,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub url: Option<String>,
}

/// Identity of a running SDK instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub app_name: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(app_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_name, self.instance_id)
    }
}

/// Buffered heartbeat awaiting the next flush
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRecord {
    pub app_name: String,
    pub instance_id: String,
    pub source_address: String,
    pub started_at: DateTime<Utc>,
    pub reporting_interval_secs: u64,
    pub metadata: SdkMetadata,
    pub received_at: DateTime<Utc>,
}

impl HeartbeatRecord {
    /// Build a record from a registration received at `received_at`
    pub fn from_registration(
        registration: &ClientRegistration,
        source_address: &str,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            app_name: registration.app_name.trim().to_string(),
            instance_id: registration.instance_id.trim().to_string(),
            source_address: source_address.to_string(),
            started_at: registration.started.unwrap_or(received_at),
            reporting_interval_secs: registration.interval / 1000,
            metadata: registration.metadata(),
            received_at,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.app_name.clone(), self.instance_id.clone())
    }

    /// Durable instance row for this heartbeat
    pub fn to_instance(&self) -> InstanceRecord {
        InstanceRecord {
            app_name: self.app_name.clone(),
            instance_id: self.instance_id.clone(),
            source_address: self.source_address.clone(),
            started_at: self.started_at,
            reporting_interval_secs: self.reporting_interval_secs,
            last_seen_at: self.received_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Canonical application row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub app_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub announced: bool,
    pub last_seen_metadata: SdkMetadata,
}

/// Input to an application upsert
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationUpsert {
    pub app_name: String,
    pub metadata: SdkMetadata,
}

/// Canonical instance row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub app_name: String,
    pub instance_id: String,
    pub source_address: String,
    pub started_at: DateTime<Utc>,
    pub reporting_interval_secs: u64,
    pub last_seen_at: DateTime<Utc>,
    pub metadata: SdkMetadata,
}

/// Domain event types written by this pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "application-created")]
    ApplicationCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationCreated => "application-created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "application-created" => Some(Self::ApplicationCreated),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record that an application was seen for the first time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub app_name: String,
    pub created_by: String,
    pub created_by_user_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl AnnouncementEvent {
    /// Create an "application created" event snapshotting `application`
    pub fn application_created(
        application: &ApplicationRecord,
        created_by: &str,
        created_by_user_id: i64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: EventType::ApplicationCreated,
            app_name: application.app_name.clone(),
            created_by: created_by.to_string(),
            created_by_user_id,
            occurred_at: Utc::now(),
            payload: serde_json::to_value(application)?,
        })
    }
}
