//! Custom error types for the application.
//!
//! This module defines the primary error type, `MonitorError`, for the entire
//! backend. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of the pipeline:
//!
//! - **`Config`** / **`Configuration`**: file/format problems versus semantic
//!   problems (values that parse but are logically invalid).
//! - **`Io`**: file and network I/O failures.
//! - **`Instrument`**: a read-collaborator could not be reached or produced a
//!   failed read. These are always recoverable; the owning worker backs off
//!   and keeps retrying.
//! - **`Bridge`**: the cross-process driver could not be launched or
//!   supervised. Escalates to channel-down status, never to a pipeline stop.
//! - **`Storage`**: a persistence policy failed this cycle. Logged; the
//!   policy retries on the next record.
//! - Rejected-command variants (`AlreadySaving`, `NoActiveCapture`, ...):
//!   reported synchronously to the caller with no process-wide effect.
//!
//! By using `#[from]`, `MonitorError` can be seamlessly created from the
//! underlying error types with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MonitorError>;

/// Central error type for the monitor backend.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An instrument read-collaborator failed.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The cross-process bridge could not be launched or supervised.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// A persistence policy failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON encoding of a wire event or record failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV row could not be written.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Rejected: rotating-log persistence is already active.
    #[error("Saving is already active")]
    AlreadySaving,

    /// Rejected: rotating-log persistence is not active.
    #[error("Saving is not active")]
    NotSaving,

    /// Rejected: there is no active capture session to promote or cancel.
    #[error("No active capture session")]
    NoActiveCapture,

    /// Rejected: the active capture session holds no records.
    #[error("Capture session '{0}' has no records to promote")]
    EmptyCapture(String),

    /// Rejected: acquisition is already running.
    #[error("Acquisition is already running")]
    AlreadyRunning,

    /// Rejected: acquisition is not running.
    #[error("Acquisition is not running")]
    NotRunning,

    /// The persistence task has stopped and can no longer accept commands.
    #[error("Persistence task is not available")]
    StorageUnavailable,
}

impl MonitorError {
    /// Whether this error is a synchronous command rejection (invalid
    /// command) rather than a pipeline fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MonitorError::AlreadySaving
                | MonitorError::NotSaving
                | MonitorError::NoActiveCapture
                | MonitorError::EmptyCapture(_)
                | MonitorError::AlreadyRunning
                | MonitorError::NotRunning
        )
    }
}
