//! # wq-core - Core types and traits for the background job engine
//!
//! This crate provides the core abstractions for the wq job engine:
//! - `Backend` trait for storage implementations
//! - `Job`, `JobId`, `JobStatus` types and the `FingerprintGuard`
//! - `Backoff` for retry scheduling
//! - `Handler`, `JobContext` and `WorkerPool` for processing jobs
//! - `Scheduler` and `CronEmitter` loops
//! - `Engine` façade and `Client` for enqueueing jobs
//! - Error types

mod backend;
mod backoff;
mod client;
mod config;
mod cron;
mod engine;
mod error;
mod fingerprint;
mod handler;
mod job;
mod scheduler;
#[cfg(test)]
mod testing;
mod worker;

// Re-export main types
pub use backend::{Backend, DynBackend, SharedBackend};
pub use backoff::{min_delay, next_run_after_with, Backoff};
pub use client::{Client, EnqueueOptions};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use cron::{cron_queue_name, parse_schedule, CronEmitter};
pub use engine::Engine;
pub use error::{Result, WqError};
pub use fingerprint::{Claim, FingerprintGuard};
pub use handler::{Handler, JobContext, JobError, JobResult, DEFAULT_DEADLINE};
pub use job::{Job, JobId, JobStatus, Payload};
pub use scheduler::{PoolRegistry, Scheduler};
pub use worker::{PoolState, WorkerPool};
