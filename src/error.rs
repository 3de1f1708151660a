//! Unified error handling for the registrar crate
//!
//! Domain modules define their own error enums; this module wraps them in a
//! single [`Error`] so scheduled jobs and the binary can handle failures
//! uniformly.
//!
//! # Architecture
//!
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! Only [`RegistrationError`] ever reaches an SDK caller. Store and sink
//! failures stay inside the scheduled tick that produced them and surface
//! through logs and metrics.

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::ingest::RegistrationError;
pub use crate::storage::{SinkError, StoreError};

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed registration input
    Validation,
    /// Application or instance store failures
    Storage,
    /// Event sink failures
    Sink,
    /// Configuration errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Sink => "sink",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the registrar crate
#[derive(Error, Debug)]
pub enum Error {
    /// Registration input rejected
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Store failure during a tick
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Event write failure
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Check if this error is transient (the next tick may succeed)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Registration(_) => false,
            Self::Store(_) => true,
            Self::Sink(_) => true,
            Self::Config(_) => false,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Registration(_) => ErrorCategory::Validation,
            Self::Store(_) => ErrorCategory::Storage,
            Self::Sink(_) => ErrorCategory::Sink,
            Self::Config(_) => ErrorCategory::Config,
            Self::Json(_) | Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
