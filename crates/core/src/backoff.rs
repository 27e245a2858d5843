//! Retry backoff for failed jobs.
//!
//! The delay grows with the fourth power of the retry count, plus a fixed
//! offset and a jitter term scaled by the retry count:
//!
//! ```text
//! delay_secs = round(retries^4) + 15 + rand[0, 30) * retries + 1
//! ```
//!
//! The result is added to `max(run_after, now)`.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

const BACKOFF_EXPONENT: i32 = 4;
const BASE_DELAY_SECS: i64 = 15;
const MAX_JITTER: u32 = 30;

/// Compute the next run time for a job that has failed `retries` times.
///
/// `jitter` must lie in `[0, 30)`.
pub fn next_run_after_with(
    retries: u32,
    run_after: DateTime<Utc>,
    now: DateTime<Utc>,
    jitter: u32,
) -> DateTime<Utc> {
    let base = run_after.max(now);
    let growth = (retries as f64).powi(BACKOFF_EXPONENT).round() as i64;
    let secs = growth
        .saturating_add(BASE_DELAY_SECS)
        .saturating_add(i64::from(jitter) * i64::from(retries))
        .saturating_add(1);
    chrono::Duration::try_seconds(secs)
        .and_then(|delay| base.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Smallest delay the formula can produce for `retries`.
pub fn min_delay(retries: u32) -> chrono::Duration {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    next_run_after_with(retries, epoch, epoch, 0) - epoch
}

/// Backoff calculator owning the jitter source.
///
/// One instance is shared by every worker pool of an engine, so tests can
/// make retries deterministic by seeding it.
#[derive(Debug)]
pub struct Backoff {
    rng: Mutex<StdRng>,
}

impl Backoff {
    /// Create a calculator seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a calculator with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Compute the next run time for a job that has failed `retries` times.
    pub fn next_run_after(&self, retries: u32, run_after: DateTime<Utc>) -> DateTime<Utc> {
        let jitter = self.jitter();
        next_run_after_with(retries, run_after, Utc::now(), jitter)
    }

    fn jitter(&self) -> u32 {
        // A poisoned lock still holds a usable generator.
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen_range(0..MAX_JITTER)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
