//! Custom error types for the scanning and acquisition core.
//!
//! Two error enums cover the whole crate:
//!
//! - **`HardwareError`**: faults raised at the hardware capability boundary (scan
//!   board timing or DMA faults, camera disconnects). The scanner absorbs these locally:
//!   it logs them, re-initializes the scan loop and opens a fresh board session.
//! - **`DslmError`**: the crate-wide error. Most variants wrap an underlying error via
//!   `#[from]` so `?` works across I/O, JSON, configuration and hardware boundaries.
//!
//! Only `DslmError::Storage` is meant to reach the operator at runtime: a failed chunk
//! flush means data loss, every other runtime fault is recovered where it happens.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DslmError>;

/// Faults reported by hardware capabilities (scan boards, frame sources).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// Sample clock or timed I/O fell behind (e.g. output buffer underrun).
    #[error("Timing fault on {channel}: {message}")]
    Timing { channel: String, message: String },

    /// DMA transfer between host and board failed.
    #[error("DMA fault: {0}")]
    Dma(String),

    /// Hardware task could not be configured with the requested settings.
    #[error("Hardware configuration rejected: {0}")]
    Configuration(String),

    /// The device went away.
    #[error("Device disconnected: {0}")]
    Disconnected(String),
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DslmError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Invalid scan parameters: {0}")]
    InvalidParameters(String),

    #[error("Worker '{0}' failed")]
    Worker(String),

    #[error("Shutdown failed: workers did not exit in time: {0:?}")]
    ShutdownFailed(Vec<String>),
}

impl DslmError {
    /// Whether the error is absorbed where it happens rather than needing
    /// operator attention.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DslmError::Hardware(_) | DslmError::InvalidParameters(_))
    }
}
