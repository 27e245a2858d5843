//! # wq - Background Job Engine
//!
//! A Rust library for running background jobs with deduplication, retries
//! and cron scheduling on top of a pluggable storage backend.
//!
//! ## Features
//!
//! - **Fingerprint deduplication**: refuse a job while another pending job
//!   carries the same fingerprint, unless the caller overrides
//! - **Delayed jobs**: jobs are not dispatched before their `run_after`
//! - **Automatic retries**: failed jobs come back with a growing, jittered backoff
//! - **Per-queue limits**: each handler has its own concurrency limit and deadline
//! - **Cron listeners**: enqueue and process a job on every tick of a cron expression
//! - **Graceful shutdown**: wait for in-flight jobs up to a caller-chosen bound
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//! use wq::{EngineConfig, Handler, Job, JobContext, JobResult};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Email {
//!     to: String,
//! }
//!
//! async fn send_email(ctx: JobContext) -> JobResult {
//!     let email: Email = ctx.payload_as()?;
//!     println!("Sending to {}", email.to);
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> wq::Result<()> {
//!     let engine = wq::in_memory(EngineConfig::default());
//!
//!     let handler = Handler::new(send_email)
//!         .with_concurrency(4)
//!         .with_deadline(Duration::from_secs(10));
//!     engine.listen("emails", handler).await?;
//!
//!     let job = Job::new("emails")
//!         .with_payload(&Email { to: "ops@example.com".into() })?
//!         .fingerprint("welcome:ops@example.com");
//!     engine.enqueue(job).await?;
//!
//!     engine.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - `wq-core`: job model, backend trait, worker pools, scheduler, cron and engine
//! - `wq-memory`: in-memory backend, the default when no other backend is chosen

pub use wq_core::*;
pub use wq_memory::{MemoryBackend, MemoryBackendBuilder, DEFAULT_MAX_RETRIES};

/// Start an engine on a fresh in-memory backend.
///
/// Must be called inside a Tokio runtime.
pub fn in_memory(config: EngineConfig) -> Engine<MemoryBackend> {
    Engine::with_backend(MemoryBackend::new(), config)
}
