//! Flush job: buffered heartbeats to durable stores
//!
//! Each tick drains the heartbeat buffer and hands the batch, as instance
//! rows plus one upsert per application, to a
//! [`BatchWriter`](crate::storage::BatchWriter). A drained
//! batch that fails to persist is dropped, not re-buffered; the next
//! heartbeat from the same instance repopulates it.
//!
//! With a single database backing every role the batch is written in one
//! transaction, so a failed tick persists nothing. Over independent stores
//! ([`SplitBatchWriter`](crate::storage::SplitBatchWriter)) a failed
//! application write leaves the batch's instance rows in place.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Job, TickGate};
use crate::error::Result;
use crate::ingest::HeartbeatBuffer;
use crate::metrics;
use crate::models::{ApplicationUpsert, HeartbeatRecord, InstanceRecord};
use crate::storage::SharedBatchWriter;

/// What one flush tick persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub instances: usize,
    pub applications: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.instances == 0
    }
}

/// Periodically persists the heartbeat buffer
pub struct FlushJob {
    buffer: Arc<HeartbeatBuffer>,
    writer: SharedBatchWriter,
    gate: TickGate,
}

impl FlushJob {
    pub fn new(buffer: Arc<HeartbeatBuffer>, writer: SharedBatchWriter) -> Self {
        Self {
            buffer,
            writer,
            gate: TickGate::new(),
        }
    }
}

/// Split a drained batch into instance rows and one upsert per application.
///
/// Application metadata comes from the latest heartbeat of that application
/// in the batch; `drained` is ordered oldest first.
fn partition(drained: &[HeartbeatRecord]) -> (Vec<InstanceRecord>, Vec<ApplicationUpsert>) {
    let instances = drained.iter().map(HeartbeatRecord::to_instance).collect();

    let mut applications: Vec<ApplicationUpsert> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for record in drained {
        match index.get(record.app_name.as_str()) {
            Some(&i) => applications[i].metadata = record.metadata.clone(),
            None => {
                index.insert(&record.app_name, applications.len());
                applications.push(ApplicationUpsert {
                    app_name: record.app_name.clone(),
                    metadata: record.metadata.clone(),
                });
            }
        }
    }

    (instances, applications)
}

#[async_trait]
impl Job for FlushJob {
    type Report = FlushReport;

    fn name(&self) -> &'static str {
        "flush"
    }

    fn gate(&self) -> &TickGate {
        &self.gate
    }

    async fn run_once(&self) -> Result<FlushReport> {
        let drained = self.buffer.drain_all();
        metrics::set_buffer_size(self.buffer.len());

        if drained.is_empty() {
            return Ok(FlushReport::default());
        }

        let (instances, applications) = partition(&drained);

        if let Err(e) = self.writer.write_batch(&instances, &applications).await {
            tracing::warn!(
                dropped = drained.len(),
                error = %e,
                "Flush failed, drained heartbeats discarded"
            );
            return Err(e.into());
        }

        metrics::record_flushed_instances(instances.len());
        tracing::debug!(
            instances = instances.len(),
            applications = applications.len(),
            "Flushed heartbeats"
        );

        Ok(FlushReport {
            instances: instances.len(),
            applications: applications.len(),
        })
    }
}
