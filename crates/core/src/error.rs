//! Error types for the wq job queue library.

use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;

/// The main error type for the wq library.
#[derive(Error, Debug)]
pub enum WqError {
    /// A pending job with the same fingerprint already exists.
    #[error("Fingerprint conflict: job {existing} is already pending with fingerprint {fingerprint:?}")]
    FingerprintConflict {
        /// The contested fingerprint.
        fingerprint: String,
        /// The pending job holding the fingerprint.
        existing: JobId,
    },

    /// The job was rejected before reaching the backend.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A handler execution ran past its deadline.
    #[error("Deadline exceeded: handler did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    /// Backend-level failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// A worker pool is already registered for the queue.
    #[error("Queue {0:?} already has a listener")]
    QueueAlreadyListening(String),

    /// The cron expression could not be parsed.
    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCron {
        /// The rejected expression.
        expr: String,
        /// Parser message.
        reason: String,
    },

    /// A handler panicked while processing a job.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// The engine has been shut down.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Result type alias using WqError.
pub type Result<T> = std::result::Result<T, WqError>;
