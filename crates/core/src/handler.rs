//! Job handlers and the context handed to them.

use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::Job;

/// Default wall-clock budget for one execution.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from job handlers.
#[derive(Debug)]
pub struct JobError {
    /// Error message.
    pub message: String,
    /// Whether the job should be retried.
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable error (job is failed permanently).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Per-execution handle giving the handler its job and a cancellation signal.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Arc<Job>,
    token: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(job: Arc<Job>, token: CancellationToken) -> Self {
        Self { job, token }
    }

    /// The job being processed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Deserialize the job payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        self.job.payload_as()
    }

    /// Whether the execution has been abandoned, e.g. after its deadline.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the execution has been abandoned.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The execution's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = JobResult> + Send + 'static>>;
type HandlerFn = dyn Fn(JobContext) -> HandlerFuture + Send + Sync;

/// A work function plus its concurrency and deadline settings.
#[derive(Clone)]
pub struct Handler {
    func: Arc<HandlerFn>,
    concurrency: usize,
    deadline: Duration,
}

impl Handler {
    /// Wrap an async function as a handler with default settings.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |ctx| Box::pin(func(ctx))),
            concurrency: default_concurrency(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Maximum simultaneous executions. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Maximum duration of a single execution.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Configured concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Configured execution deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub(crate) fn call(&self, ctx: JobContext) -> HandlerFuture {
        (self.func)(ctx)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("concurrency", &self.concurrency)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}
