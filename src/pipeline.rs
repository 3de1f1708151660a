//! Pipeline assembly and lifecycle
//!
//! [`Pipeline`] owns one heartbeat buffer, the registration service writing
//! into it, and the two background jobs reading from it. Stores are passed
//! in, so several pipelines can share one set of stores the way several
//! server processes share one database.

use std::sync::Arc;

use futures::future::join_all;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::ingest::{HeartbeatBuffer, RegistrationError, RegistrationService};
use crate::models::ClientRegistration;
use crate::scheduler::{
    AnnouncementJob, AnnouncementReport, FlushJob, FlushReport, Job, PeriodicTask, TickOutcome,
};
use crate::storage::Stores;

/// One registration pipeline instance
pub struct Pipeline {
    config: PipelineConfig,
    stores: Stores,
    registration: RegistrationService,
    flush: Arc<FlushJob>,
    announce: Arc<AnnouncementJob>,
    tasks: Vec<PeriodicTask>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, stores: Stores) -> Self {
        let buffer = Arc::new(HeartbeatBuffer::new());
        let registration = RegistrationService::new(Arc::clone(&buffer));
        let flush = Arc::new(FlushJob::new(buffer, Arc::clone(&stores.batches)));
        let announce = Arc::new(AnnouncementJob::new(
            Arc::clone(&stores.applications),
            Arc::clone(&stores.events),
            config.system_actor.clone(),
            config.system_user_id,
        ));

        Self {
            config,
            stores,
            registration,
            flush,
            announce,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Handle for callers on the request path
    pub fn registration(&self) -> RegistrationService {
        self.registration.clone()
    }

    pub fn register_heartbeat(
        &self,
        registration: &ClientRegistration,
        source_address: &str,
    ) -> std::result::Result<(), RegistrationError> {
        self.registration.register_heartbeat(registration, source_address)
    }

    pub fn buffered(&self) -> usize {
        self.registration.buffer().len()
    }

    /// Run one flush tick now
    pub async fn flush(&self) -> Result<TickOutcome<FlushReport>> {
        self.flush.tick().await
    }

    /// Run one announcement tick now
    pub async fn announce(&self) -> Result<TickOutcome<AnnouncementReport>> {
        self.announce.tick().await
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn the flush and announcement timers. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        self.tasks.push(PeriodicTask::spawn(
            Arc::clone(&self.flush),
            self.config.flush_interval(),
        ));
        self.tasks.push(PeriodicTask::spawn(
            Arc::clone(&self.announce),
            self.config.announcement_interval(),
        ));

        tracing::info!(
            flush_interval_ms = self.config.flush_interval_ms,
            announcement_interval_ms = self.config.announcement_interval_ms,
            "Pipeline started"
        );
    }

    /// Stop both timers, waiting for in-flight ticks
    ///
    /// With `flush_on_shutdown` set, one last flush persists whatever is still
    /// buffered and its report is returned.
    pub async fn shutdown(&mut self) -> Result<Option<FlushReport>> {
        join_all(self.tasks.drain(..).map(PeriodicTask::stop)).await;

        if !self.config.flush_on_shutdown {
            let discarded = self.buffered();
            if discarded > 0 {
                tracing::warn!(discarded, "Pipeline stopped with unflushed heartbeats");
            }
            return Ok(None);
        }

        let report = self.flush.tick().await?.completed().unwrap_or_default();
        tracing::info!(instances = report.instances, "Pipeline stopped after final flush");
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(flush_on_shutdown: bool) -> PipelineConfig {
        PipelineConfig::builder()
            .flush_interval(Duration::from_secs(3600))
            .announcement_interval(Duration::from_secs(3600))
            .flush_on_shutdown(flush_on_shutdown)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_manual_ticks() {
        let pipeline = Pipeline::new(config(true), Stores::in_memory());
        pipeline
            .register_heartbeat(&ClientRegistration::new("billing", "pod-1"), "10.0.0.1")
            .unwrap();

        let flushed = pipeline.flush().await.unwrap().completed().unwrap();
        let announced = pipeline.announce().await.unwrap().completed().unwrap();

        assert_eq!(flushed.instances, 1);
        assert_eq!(announced.announced, 1);
        assert_eq!(pipeline.stores().events.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer() {
        let mut pipeline = Pipeline::new(config(true), Stores::in_memory());
        pipeline.start();
        // Let the immediate first ticks pass before buffering
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipeline
            .register_heartbeat(&ClientRegistration::new("billing", "pod-1"), "10.0.0.1")
            .unwrap();
        let report = pipeline.shutdown().await.unwrap();

        assert_eq!(report, Some(FlushReport { instances: 1, applications: 1 }));
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.stores().applications.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_final_flush() {
        let mut pipeline = Pipeline::new(config(false), Stores::in_memory());
        pipeline.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipeline
            .register_heartbeat(&ClientRegistration::new("billing", "pod-1"), "10.0.0.1")
            .unwrap();

        assert_eq!(pipeline.shutdown().await.unwrap(), None);
        assert!(pipeline.stores().applications.list().await.unwrap().is_empty());
    }
}
