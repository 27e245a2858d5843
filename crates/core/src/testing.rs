//! Backend stub for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::error::{Result, WqError};
use crate::job::{Job, JobId, JobStatus};

/// Stores nothing and records every failed attempt it is told about.
#[derive(Clone, Default)]
pub(crate) struct RecordingBackend {
    failures: Arc<Mutex<Vec<(JobId, String)>>>,
}

impl RecordingBackend {
    pub(crate) fn failures(&self) -> Vec<(JobId, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn store(&self, _job: Job, _override: bool) -> Result<JobId> {
        Err(WqError::Storage("recording backend stores nothing".to_string()))
    }
    async fn fetch_ready(&self, _queue: &str, _limit: usize) -> Result<Vec<Job>> {
        Ok(Vec::new())
    }
    async fn mark_processed(&self, _id: JobId) -> Result<()> {
        Ok(())
    }
    async fn mark_failed(
        &self,
        id: JobId,
        _run_after: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<JobStatus> {
        self.failures.lock().unwrap().push((id, error.to_string()));
        Ok(JobStatus::New)
    }
    async fn release(&self, _id: JobId) -> Result<()> {
        Ok(())
    }
    async fn job(&self, _id: JobId) -> Result<Option<Job>> {
        Ok(None)
    }
    async fn queue_len(&self, _queue: &str) -> Result<usize> {
        Ok(0)
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
