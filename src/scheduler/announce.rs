//! Announcement job: one "application created" event per application
//!
//! Per application the state machine is
//! `unseen -> unannounced -> announced`, and `announced` is terminal.
//! The store-side conditional flip of the announced flag decides which
//! caller emits the event, so concurrent pipelines sharing a store never
//! announce the same application twice.
//!
//! The flag is set before the event is written. If the sink then fails, the
//! application stays announced and its event is lost; the failure is logged
//! and counted but never retried or rolled back.

use async_trait::async_trait;

use super::{Job, TickGate};
use crate::error::Result;
use crate::metrics;
use crate::models::AnnouncementEvent;
use crate::storage::{SharedApplicationStore, SharedEventSink};

/// What one announcement tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnouncementReport {
    /// Unannounced rows seen at the start of the tick
    pub pending: usize,
    /// Flips won by this tick whose event was written
    pub announced: usize,
    /// Rows another process flipped first
    pub claimed_elsewhere: usize,
    /// Flips won whose event write failed
    pub event_failures: usize,
}

/// Periodically announces newly seen applications
pub struct AnnouncementJob {
    applications: SharedApplicationStore,
    events: SharedEventSink,
    actor: String,
    actor_user_id: i64,
    gate: TickGate,
}

impl AnnouncementJob {
    pub fn new(
        applications: SharedApplicationStore,
        events: SharedEventSink,
        actor: impl Into<String>,
        actor_user_id: i64,
    ) -> Self {
        Self {
            applications,
            events,
            actor: actor.into(),
            actor_user_id,
            gate: TickGate::new(),
        }
    }
}

#[async_trait]
impl Job for AnnouncementJob {
    type Report = AnnouncementReport;

    fn name(&self) -> &'static str {
        "announce"
    }

    fn gate(&self) -> &TickGate {
        &self.gate
    }

    async fn run_once(&self) -> Result<AnnouncementReport> {
        let pending = self.applications.find_unannounced().await?;
        let mut report = AnnouncementReport {
            pending: pending.len(),
            ..Default::default()
        };

        for mut application in pending {
            if !self.applications.try_mark_announced(&application.app_name).await? {
                report.claimed_elsewhere += 1;
                tracing::debug!(app_name = %application.app_name, "Already announced elsewhere");
                continue;
            }
            application.announced = true;

            let written = match AnnouncementEvent::application_created(
                &application,
                &self.actor,
                self.actor_user_id,
            ) {
                Ok(event) => self.events.append(&event).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match written {
                Ok(()) => {
                    report.announced += 1;
                    metrics::record_announced();
                    tracing::info!(app_name = %application.app_name, "Application announced");
                }
                Err(reason) => {
                    report.event_failures += 1;
                    metrics::record_announcement_event_failure();
                    tracing::error!(
                        app_name = %application.app_name,
                        error = %reason,
                        "Application marked announced but event write failed"
                    );
                }
            }
        }

        Ok(report)
    }
}
