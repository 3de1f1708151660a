//! Heartbeat registration entry point
//!
//! SDK heartbeats enter the pipeline here. Registration validates the
//! identity fields and writes into the shared [`HeartbeatBuffer`]; it never
//! touches a store, so store latency or outages cannot reach the caller.

pub mod buffer;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::metrics;
use crate::models::{ClientRegistration, HeartbeatRecord};

pub use buffer::HeartbeatBuffer;

/// Errors returned to SDK callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// A required identity field is missing or blank
    #[error("Invalid registration: '{field}' must be a non-empty string")]
    Validation { field: &'static str },
}

/// Accepts heartbeats and buffers them for the next flush
#[derive(Clone)]
pub struct RegistrationService {
    buffer: Arc<HeartbeatBuffer>,
}

impl RegistrationService {
    pub fn new(buffer: Arc<HeartbeatBuffer>) -> Self {
        Self { buffer }
    }

    /// Validate and buffer one heartbeat
    ///
    /// Fails only with [`RegistrationError::Validation`]; the buffer is left
    /// untouched in that case.
    pub fn register_heartbeat(
        &self,
        registration: &ClientRegistration,
        source_address: &str,
    ) -> Result<(), RegistrationError> {
        if let Err(e) = validate(registration) {
            metrics::record_heartbeat_rejected();
            tracing::debug!(source = source_address, error = %e, "Rejected heartbeat");
            return Err(e);
        }

        let record = HeartbeatRecord::from_registration(registration, source_address, Utc::now());
        let replaced = self.buffer.put(record);

        metrics::record_heartbeat(self.buffer.len());
        tracing::trace!(
            app_name = %registration.app_name,
            instance_id = %registration.instance_id,
            replaced,
            "Heartbeat buffered"
        );
        Ok(())
    }

    pub fn buffer(&self) -> &Arc<HeartbeatBuffer> {
        &self.buffer
    }
}

fn validate(registration: &ClientRegistration) -> Result<(), RegistrationError> {
    if registration.app_name.trim().is_empty() {
        return Err(RegistrationError::Validation { field: "appName" });
    }
    if registration.instance_id.trim().is_empty() {
        return Err(RegistrationError::Validation { field: "instanceId" });
    }
    Ok(())
}
