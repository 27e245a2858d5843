//! Per-queue worker pool.
//!
//! A pool owns the handler for one queue and a semaphore sized to the
//! handler's concurrency. The scheduler asks it how many slots are free,
//! fetches that many ready jobs and hands them over with [`WorkerPool::dispatch`].
//! Each execution runs as its own task, raced against the handler deadline.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::backoff::Backoff;
use crate::error::WqError;
use crate::handler::{Handler, JobContext, JobError, JobResult};
use crate::job::{Job, JobStatus};

/// Lifecycle of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    /// Created, not yet accepting jobs.
    Idle = 0,
    /// Accepting and executing jobs.
    Running = 1,
    /// Refusing new jobs, waiting for in-flight executions.
    Draining = 2,
    /// No executions left.
    Stopped = 3,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Idle,
            1 => PoolState::Running,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }
}

/// Worker pool for processing the jobs of one queue.
pub struct WorkerPool<B: Backend + Clone + 'static> {
    queue: String,
    handler: Handler,
    backend: B,
    backoff: Arc<Backoff>,
    slots: Arc<Semaphore>,
    state: AtomicU8,
    in_progress: AtomicUsize,
    drain_notify: Notify,
    wake: Arc<Notify>,
}

impl<B: Backend + Clone + 'static> WorkerPool<B> {
    /// Create an idle pool. `wake` is notified whenever a slot frees up.
    pub fn new(
        queue: impl Into<String>,
        handler: Handler,
        backend: B,
        backoff: Arc<Backoff>,
        wake: Arc<Notify>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(handler.concurrency()));
        Self {
            queue: queue.into(),
            handler,
            backend,
            backoff,
            slots,
            state: AtomicU8::new(PoolState::Idle as u8),
            in_progress: AtomicUsize::new(0),
            drain_notify: Notify::new(),
            wake,
        }
    }

    /// Queue served by this pool.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Start accepting jobs.
    pub fn start(&self) {
        let _ = self.state.compare_exchange(
            PoolState::Idle as u8,
            PoolState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        tracing::info!(
            queue = %self.queue,
            concurrency = self.handler.concurrency(),
            deadline_ms = self.handler.deadline().as_millis() as u64,
            "Worker pool started"
        );
    }

    /// Number of jobs the pool can take right now.
    pub fn available_slots(&self) -> usize {
        if self.state() != PoolState::Running {
            return 0;
        }
        self.slots.available_permits()
    }

    /// Get the number of in-progress executions.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Start executing `job`, or hand it back if the pool is not running or
    /// has no free slot.
    pub fn dispatch(self: &Arc<Self>, job: Job) -> std::result::Result<(), Job> {
        // Counted before the state check so a concurrent drain waits for us.
        self.in_progress.fetch_add(1, Ordering::SeqCst);
        if self.state() != PoolState::Running {
            self.finish_refused();
            return Err(job);
        }
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.finish_refused();
                return Err(job);
            }
        };

        tracing::debug!(queue = %self.queue, job_id = %job.id, retries = job.retries, "Dispatching job");

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.execute(job, permit).await;
        });
        Ok(())
    }

    fn finish_refused(&self) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.drain_notify.notify_waiters();
    }

    /// Stop taking new jobs.
    pub fn begin_drain(&self) {
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
            match PoolState::from_u8(state) {
                PoolState::Idle | PoolState::Running => Some(PoolState::Draining as u8),
                _ => None,
            }
        });
    }

    /// Wait until every in-flight execution has finished, then mark the pool stopped.
    ///
    /// Callers bound this wait themselves; executions still running when the
    /// future is dropped keep running and settle their job when they finish.
    pub async fn drained(&self) {
        while self.in_progress.load(Ordering::SeqCst) > 0 {
            // Wait for notification or timeout
            tokio::select! {
                _ = self.drain_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
        tracing::info!(queue = %self.queue, "Worker pool stopped");
    }

    async fn execute(&self, job: Job, permit: OwnedSemaphorePermit) {
        let job = Arc::new(job);
        let token = CancellationToken::new();
        let ctx = JobContext::new(Arc::clone(&job), token.clone());
        let deadline = self.handler.deadline();

        // Closures may panic before returning their future; call inside the task.
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.call(ctx).await });
        let outcome = match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(join_failure(err)),
            Err(_) => {
                token.cancel();
                task.abort();
                Err(JobError::retryable(
                    WqError::DeadlineExceeded(deadline).to_string(),
                ))
            }
        };

        self.settle(&job, outcome).await;

        drop(permit);
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.drain_notify.notify_waiters();
        self.wake.notify_one();
    }

    async fn settle(&self, job: &Job, outcome: JobResult) {
        match outcome {
            Ok(()) => {
                if let Err(e) = self.backend.mark_processed(job.id).await {
                    tracing::error!(queue = %self.queue, job_id = %job.id, error = %e, "Failed to mark job processed");
                    self.release(job).await;
                    return;
                }
                tracing::debug!(queue = %self.queue, job_id = %job.id, "Job completed successfully");
            }
            Err(err) => {
                tracing::error!(
                    queue = %self.queue,
                    job_id = %job.id,
                    retries = job.retries,
                    error = %err.message,
                    "job failed"
                );

                let run_after = err
                    .retryable
                    .then(|| self.backoff.next_run_after(job.retries + 1, job.run_after));

                match self.backend.mark_failed(job.id, run_after, &err.message).await {
                    Ok(JobStatus::New) => {
                        tracing::debug!(
                            queue = %self.queue,
                            job_id = %job.id,
                            retries = job.retries + 1,
                            run_after = ?run_after,
                            "Job scheduled for retry"
                        );
                    }
                    Ok(status) => {
                        tracing::warn!(queue = %self.queue, job_id = %job.id, status = ?status, "Job failed permanently");
                    }
                    Err(e) => {
                        tracing::error!(queue = %self.queue, job_id = %job.id, error = %e, "Failed to record job failure");
                        self.release(job).await;
                    }
                }
            }
        }
    }

    /// Hand the job back so a later poll can pick it up again.
    async fn release(&self, job: &Job) {
        if let Err(e) = self.backend.release(job.id).await {
            tracing::error!(queue = %self.queue, job_id = %job.id, error = %e, "Failed to release job");
        }
    }
}

fn join_failure(err: JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::retryable(format!("handler task cancelled: {}", err));
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    JobError::retryable(WqError::HandlerPanicked(message).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use crate::testing::RecordingBackend;

    #[test]
    fn test_pool_state_from_u8() {
        assert_eq!(PoolState::from_u8(0), PoolState::Idle);
        assert_eq!(PoolState::from_u8(1), PoolState::Running);
        assert_eq!(PoolState::from_u8(2), PoolState::Draining);
        assert_eq!(PoolState::from_u8(3), PoolState::Stopped);
        assert_eq!(PoolState::from_u8(200), PoolState::Stopped);
    }

    fn pool(handler: Handler, backend: RecordingBackend) -> Arc<WorkerPool<RecordingBackend>> {
        Arc::new(WorkerPool::new(
            "q",
            handler,
            backend,
            Arc::new(Backoff::seeded(1)),
            Arc::new(Notify::new()),
        ))
    }

    fn stored_job(id: i64) -> Job {
        let mut job = Job::new("q");
        job.id = JobId(id);
        job
    }

    #[tokio::test]
    async fn test_synchronous_handler_panic_is_recorded() {
        let backend = RecordingBackend::default();
        let handler = Handler::new(|ctx: JobContext| {
            let n = ctx.job().payload.get("n").and_then(|v| v.as_i64());
            let n = n.expect("payload has n");
            async move {
                let _ = n;
                Ok(())
            }
        });
        let pool = pool(handler, backend.clone());
        pool.start();

        assert!(pool.dispatch(stored_job(7)).is_ok());
        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.in_progress_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let failures = backend.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, JobId(7));
        assert!(failures[0].1.starts_with("Handler panicked: payload has n"));
        assert_eq!(pool.available_slots(), pool.handler.concurrency());
    }

    #[tokio::test]
    async fn test_dispatch_after_drain_is_refused_without_leaking() {
        let pool = pool(Handler::new(|_ctx| async { Ok(()) }), RecordingBackend::default());
        pool.start();
        pool.begin_drain();

        let job = pool.dispatch(stored_job(3)).unwrap_err();
        assert_eq!(job.id, JobId(3));
        assert_eq!(pool.in_progress_count(), 0);

        tokio::time::timeout(Duration::from_millis(500), pool.drained())
            .await
            .unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn test_dispatch_without_free_slot_is_refused() {
        let handler = Handler::new(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .with_concurrency(1);
        let pool = pool(handler, RecordingBackend::default());
        pool.start();

        assert!(pool.dispatch(stored_job(1)).is_ok());
        assert!(pool.dispatch(stored_job(2)).is_err());
        assert_eq!(pool.in_progress_count(), 1);
    }

    #[tokio::test]
    async fn test_join_failure_reports_panic_message() {
        let err = tokio::spawn(async { panic!("boom"); }).await.unwrap_err();
        let job_err = join_failure(err);
        assert!(job_err.retryable);
        assert_eq!(job_err.message, "Handler panicked: boom");
    }

    #[tokio::test]
    async fn test_join_failure_reports_formatted_panic() {
        let code = 7;
        let err = tokio::spawn(async move { panic!("exit code {}", code); })
            .await
            .unwrap_err();
        assert_eq!(join_failure(err).message, "Handler panicked: exit code 7");
    }
}
