//! Engine façade: enqueue, listen, listen for cron ticks, shut down.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::backoff::Backoff;
use crate::client::{Client, EnqueueOptions};
use crate::config::EngineConfig;
use crate::cron::{cron_queue_name, parse_schedule, CronEmitter};
use crate::error::{Result, WqError};
use crate::handler::Handler;
use crate::job::{Job, JobId};
use crate::scheduler::{PoolRegistry, Scheduler};
use crate::worker::WorkerPool;

/// Job processing engine over a storage backend.
///
/// Starting an engine spawns its scheduler, so it must happen inside a Tokio
/// runtime.
pub struct Engine<B: Backend + Clone + 'static = SharedBackend> {
    config: EngineConfig,
    backend: B,
    client: Client<B>,
    pools: PoolRegistry<B>,
    backoff: Arc<Backoff>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Engine<SharedBackend> {
    /// Start an engine over any backend implementation.
    pub fn start(backend: impl Backend + 'static, config: EngineConfig) -> Self {
        Self::with_backend(SharedBackend::new(backend), config)
    }
}

impl<B: Backend + Clone + 'static> Engine<B> {
    /// Start an engine over a concrete backend type.
    pub fn with_backend(backend: B, config: EngineConfig) -> Self {
        let wake = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let pools: PoolRegistry<B> = Arc::new(RwLock::new(HashMap::new()));
        let backoff = Arc::new(match config.backoff_seed {
            Some(seed) => Backoff::seeded(seed),
            None => Backoff::new(),
        });

        let mut tasks = JoinSet::new();
        let scheduler = Scheduler::new(
            backend.clone(),
            pools.clone(),
            config.job_check_interval,
            wake.clone(),
            shutdown.clone(),
        );
        tasks.spawn(async move { scheduler.run().await });

        tracing::info!(
            job_check_interval_ms = config.job_check_interval.as_millis() as u64,
            "Engine started"
        );

        Self {
            client: Client::attached(backend.clone(), wake.clone(), closed.clone()),
            config,
            backend,
            pools,
            backoff,
            wake,
            shutdown,
            closed,
            tasks: Mutex::new(tasks),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// A cloneable enqueue handle bound to this engine.
    pub fn client(&self) -> Client<B> {
        self.client.clone()
    }

    /// Enqueue a job and return its id.
    pub async fn enqueue(&self, job: Job) -> Result<JobId> {
        self.client.enqueue(job).await
    }

    /// Enqueue a job with options, e.g. overriding a matching fingerprint.
    pub async fn enqueue_with(&self, job: Job, options: EnqueueOptions) -> Result<JobId> {
        self.client.enqueue_with(job, options).await
    }

    /// Register `handler` for `queue` and start dispatching its jobs.
    ///
    /// A queue has at most one listener; registering again fails with
    /// [`WqError::QueueAlreadyListening`].
    pub async fn listen(&self, queue: impl Into<String>, handler: Handler) -> Result<()> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(WqError::Config("queue name is empty".to_string()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(WqError::ShuttingDown);
        }

        let mut pools = self.pools.write().await;
        // Shutdown snapshots the pools after setting `closed`; recheck under the lock.
        if self.closed.load(Ordering::SeqCst) {
            return Err(WqError::ShuttingDown);
        }
        match pools.entry(queue.clone()) {
            Entry::Occupied(_) => return Err(WqError::QueueAlreadyListening(queue)),
            Entry::Vacant(slot) => {
                let pool = Arc::new(WorkerPool::new(
                    queue,
                    handler,
                    self.backend.clone(),
                    self.backoff.clone(),
                    self.wake.clone(),
                ));
                pool.start();
                slot.insert(pool);
            }
        }
        drop(pools);

        self.wake.notify_one();
        Ok(())
    }

    /// Enqueue a job on every tick of `cron_expr` and process it with `handler`.
    ///
    /// Expressions are seconds-first, e.g. `"* * * * * *"` for every second.
    /// The jobs go to the queue named by [`cron_queue_name`].
    pub async fn listen_cron(&self, cron_expr: &str, handler: Handler) -> Result<()> {
        let schedule = parse_schedule(cron_expr)?;
        let queue = cron_queue_name(cron_expr);

        self.listen(queue.clone(), handler).await?;

        let emitter = CronEmitter::new(
            cron_expr,
            schedule,
            queue,
            self.client.clone(),
            self.shutdown.clone(),
        );
        self.tasks
            .lock()
            .await
            .spawn(async move { emitter.run().await });
        Ok(())
    }

    /// Whether a listener is registered for `queue`.
    pub async fn is_listening(&self, queue: &str) -> bool {
        self.pools.read().await.contains_key(queue)
    }

    /// Shut down, waiting at most `shutdown_timeout` for in-flight executions.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        self.shutdown_with(tokio::time::sleep(timeout)).await
    }

    /// Shut down, waiting for in-flight executions until `signal` resolves.
    ///
    /// New enqueues and listeners are refused immediately. Ready jobs that
    /// have not started stay pending in the backend. Executions still running
    /// when `signal` fires are not killed; they settle their job whenever
    /// they finish.
    pub async fn shutdown_with<S>(&self, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Shutdown requested, draining...");

        let pools: Vec<Arc<WorkerPool<B>>> = self.pools.read().await.values().cloned().collect();
        for pool in &pools {
            pool.begin_drain();
        }
        self.shutdown.cancel();

        let drain = async {
            for pool in &pools {
                pool.drained().await;
            }
        };

        tokio::pin!(signal);
        let timed_out = tokio::select! {
            _ = drain => false,
            _ = &mut signal => {
                let in_progress: usize = pools.iter().map(|p| p.in_progress_count()).sum();
                tracing::warn!(in_progress, "Shutdown timeout reached, leaving in-flight jobs");
                true
            }
        };

        // Scheduler and cron loops exit on the cancelled token.
        let mut tasks = self.tasks.lock().await;
        let joined = !timed_out
            && tokio::select! {
                _ = join_all(&mut tasks) => true,
                _ = &mut signal => false,
            };
        if !joined {
            tasks.abort_all();
        }
        drop(tasks);

        self.backend.shutdown().await?;
        tracing::info!("Engine stopped");
        Ok(())
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Engine task panicked");
        }
    }
}
