//! Scheduler that hands due jobs to worker pools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::Result;
use crate::worker::WorkerPool;

/// Worker pools by queue name.
pub type PoolRegistry<B> = Arc<RwLock<HashMap<String, Arc<WorkerPool<B>>>>>;

/// Scheduler that polls the backend for ready jobs.
///
/// Runs every `interval`, and early whenever `wake` is notified (a job was
/// enqueued, a listener registered, or an execution freed a slot). On each
/// pass every pool receives at most as many jobs as it has free slots.
pub struct Scheduler<B: Backend + Clone + 'static> {
    backend: B,
    pools: PoolRegistry<B>,
    interval: Duration,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl<B: Backend + Clone + 'static> Scheduler<B> {
    /// Create a new Scheduler.
    pub fn new(
        backend: B,
        pools: PoolRegistry<B>,
        interval: Duration,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            pools,
            interval,
            wake,
            shutdown,
        }
    }

    /// Run the scheduler loop until the shutdown token fires.
    pub async fn run(&self) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Scheduler started");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            self.tick().await;
        }

        tracing::info!("Scheduler stopped");
    }

    /// Process one pass over every registered pool.
    pub async fn tick(&self) {
        let pools: Vec<Arc<WorkerPool<B>>> = self.pools.read().await.values().cloned().collect();

        for pool in pools {
            if self.shutdown.is_cancelled() {
                return;
            }
            if let Err(e) = self.dispatch_ready(&pool).await {
                tracing::error!(queue = %pool.queue(), error = %e, "Scheduler tick failed");
            }
        }
    }

    async fn dispatch_ready(&self, pool: &Arc<WorkerPool<B>>) -> Result<()> {
        let slots = pool.available_slots();
        if slots == 0 {
            return Ok(());
        }

        let jobs = self.backend.fetch_ready(pool.queue(), slots).await?;
        if jobs.is_empty() {
            return Ok(());
        }

        tracing::debug!(count = jobs.len(), queue = %pool.queue(), "Dispatching ready jobs");

        for job in jobs {
            if let Err(job) = pool.dispatch(job) {
                tracing::debug!(queue = %pool.queue(), job_id = %job.id, "Pool refused job, releasing");
                if let Err(e) = self.backend.release(job.id).await {
                    tracing::error!(queue = %pool.queue(), job_id = %job.id, error = %e, "Failed to release job");
                }
            }
        }

        Ok(())
    }
}
