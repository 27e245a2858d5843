//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, WqError};

/// Arbitrary key/value payload carried by a job. Never interpreted by the engine.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Backend-assigned identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Sentinel carried by jobs that have not been stored yet.
    pub const UNASSIGNED: JobId = JobId(-1);

    /// Whether a backend has assigned this id.
    pub fn is_assigned(&self) -> bool {
        self.0 >= 0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Pending; eligible once `run_after` has passed.
    New,
    /// Handler returned without error.
    Processed,
    /// Handler failed and no retries remain.
    Failed,
}

impl JobStatus {
    /// Whether the job will never be dispatched again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::New)
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Backend-assigned identifier, [`JobId::UNASSIGNED`] until stored.
    pub id: JobId,
    /// Queue the job is dispatched on.
    pub queue: String,
    /// Opaque payload handed to the handler.
    pub payload: Payload,
    /// Deduplication key; `None` means no deduplication.
    pub fingerprint: Option<String>,
    /// The job is not dispatched before this instant.
    pub run_after: DateTime<Utc>,
    /// Current job status.
    pub status: JobStatus,
    /// Number of failed attempts so far.
    pub retries: u32,
    /// Per-job retry ceiling; the backend default applies when `None`.
    pub max_retries: Option<u32>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Error message from the last failure.
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new job on `queue`, due immediately, with an empty payload.
    pub fn new(queue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::UNASSIGNED,
            queue: queue.into(),
            payload: Payload::new(),
            fingerprint: None,
            run_after: now,
            status: JobStatus::New,
            retries: 0,
            max_retries: None,
            created_at: now,
            last_error: None,
        }
    }

    /// Replace the payload.
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the payload from any value serializing to a JSON object.
    pub fn with_payload<T: Serialize>(mut self, value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(map) => {
                self.payload = map;
                Ok(self)
            }
            other => Err(WqError::InvalidJob(format!(
                "payload must serialize to an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Insert a single payload entry.
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set the deduplication fingerprint. An empty string clears it.
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        let fingerprint = fingerprint.into();
        self.fingerprint = (!fingerprint.is_empty()).then_some(fingerprint);
        self
    }

    /// Run the job no earlier than `at`.
    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = at;
        self
    }

    /// Run the job after a delay from now.
    pub fn run_in(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.run_after(at)
    }

    /// Override the backend's retry ceiling for this job.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Deserialize the payload into the shape the handler expects.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            self.payload.clone(),
        ))?)
    }

    /// Whether the job may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::New && self.run_after <= now
    }

    /// Reject jobs that cannot be stored.
    pub fn validate(&self) -> Result<()> {
        if self.queue.trim().is_empty() {
            return Err(WqError::InvalidJob("queue name is empty".to_string()));
        }
        if self.status != JobStatus::New {
            return Err(WqError::InvalidJob(format!(
                "new jobs must have status new, got {:?}",
                self.status
            )));
        }
        Ok(())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
