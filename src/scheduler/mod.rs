//! Fixed-interval background jobs
//!
//! The pipeline runs two recurring jobs off the request path:
//!
//! - [`flush`] - drains the heartbeat buffer into the instance and
//!   application stores
//! - [`announce`] - claims unannounced applications and emits one
//!   "application created" event per claim
//!
//! # Architecture
//!
//! ```text
//!  register_heartbeat ──► HeartbeatBuffer
//!                              │
//!               (flush interval)│
//!                              ▼
//!                         FlushJob ──► InstanceStore, ApplicationStore
//!                                                      │
//!                                 (announcement interval)
//!                                                      ▼
//!                                              AnnouncementJob ──► EventSink
//! ```
//!
//! Each job is driven by its own [`PeriodicTask`]. A job's ticks never
//! overlap: the timer loop awaits every tick, and a [`TickGate`] turns any
//! tick requested while another is running into [`TickOutcome::Skipped`].
//! Ticks of different jobs run independently.
//!
//! A failing tick is logged and counted; it never ends the timer loop.

pub mod announce;
pub mod flush;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::metrics;

pub use announce::{AnnouncementJob, AnnouncementReport};
pub use flush::{FlushJob, FlushReport};

// ============================================================================
// Tick serialization
// ============================================================================

/// Busy flag that admits one tick at a time
#[derive(Debug, Default)]
pub struct TickGate {
    busy: AtomicBool,
}

impl TickGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate, or `None` if a tick is already running
    pub fn try_enter(&self) -> Option<TickGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the gate on drop
#[derive(Debug)]
pub struct TickGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Result of requesting a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome<R> {
    /// The tick ran to completion
    Completed(R),
    /// Another tick of the same job was still running
    Skipped,
}

impl<R> TickOutcome<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

// ============================================================================
// Job
// ============================================================================

/// A unit of recurring background work
#[async_trait]
pub trait Job: Send + Sync + 'static {
    type Report: std::fmt::Debug + Send;

    /// Stable name used in logs and metric labels
    fn name(&self) -> &'static str;

    fn gate(&self) -> &TickGate;

    /// One unguarded pass of the job
    async fn run_once(&self) -> Result<Self::Report>;

    /// Run one tick unless another tick of this job is in progress
    async fn tick(&self) -> Result<TickOutcome<Self::Report>> {
        let Some(_guard) = self.gate().try_enter() else {
            tracing::debug!(job = self.name(), "Tick already running, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let _timer = metrics::start_tick_timer(self.name());
        self.run_once().await.map(TickOutcome::Completed)
    }
}

// ============================================================================
// Periodic Task
// ============================================================================

/// Background task that ticks a job on a fixed interval until stopped
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn the timer loop for `job`
    ///
    /// The first tick fires immediately. Ticks that fall due while a slow tick
    /// is still running are skipped rather than queued.
    pub fn spawn<J: Job>(job: Arc<J>, period: Duration) -> Self {
        let name = job.name();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(job = name, period_ms = period.as_millis() as u64, "Periodic task started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::run_tick(job.as_ref()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!(job = name, "Periodic task shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            name,
            shutdown,
            handle,
        }
    }

    async fn run_tick<J: Job>(job: &J) {
        match job.tick().await {
            Ok(TickOutcome::Completed(report)) => {
                metrics::record_tick(job.name(), "completed");
                tracing::debug!(job = job.name(), ?report, "Tick completed");
            }
            Ok(TickOutcome::Skipped) => {
                metrics::record_tick(job.name(), "skipped");
            }
            Err(e) => {
                metrics::record_tick(job.name(), "failed");
                tracing::warn!(
                    job = job.name(),
                    error = %e,
                    recoverable = e.is_recoverable(),
                    "Tick failed"
                );
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop to stop and wait for the in-flight tick to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(job = self.name, error = %e, "Periodic task panicked");
        }
    }
}
