//! Fingerprint-based deduplication of pending jobs.
//!
//! The guard only tracks jobs in `new` status. A backend consults it and
//! records the new job while holding the same lock that protects its job
//! store, so check-and-store is atomic and concurrent enqueues sharing a
//! fingerprint have exactly one winner.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, WqError};
use crate::job::JobId;

/// Outcome of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The job carries no fingerprint.
    Unguarded,
    /// No pending job holds the fingerprint.
    Claimed,
    /// Pending jobs hold the fingerprint but the caller asked to override.
    /// They are left untouched and coexist with the new job.
    Overridden {
        /// The oldest pending job with the same fingerprint.
        existing: JobId,
    },
}

/// Index of pending jobs by fingerprint.
#[derive(Debug, Default)]
pub struct FingerprintGuard {
    pending: HashMap<String, BTreeSet<JobId>>,
}

impl FingerprintGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a job with `fingerprint` may be stored.
    ///
    /// Fails with [`WqError::FingerprintConflict`] when a pending job holds
    /// the fingerprint and `override_matching` is false.
    pub fn try_claim(&self, fingerprint: Option<&str>, override_matching: bool) -> Result<Claim> {
        let Some(fingerprint) = fingerprint.filter(|fp| !fp.is_empty()) else {
            return Ok(Claim::Unguarded);
        };

        match self.holder(fingerprint) {
            None => Ok(Claim::Claimed),
            Some(existing) if override_matching => Ok(Claim::Overridden { existing }),
            Some(existing) => Err(WqError::FingerprintConflict {
                fingerprint: fingerprint.to_string(),
                existing,
            }),
        }
    }

    /// Record a stored pending job.
    pub fn record(&mut self, fingerprint: Option<&str>, id: JobId) {
        if let Some(fingerprint) = fingerprint.filter(|fp| !fp.is_empty()) {
            self.pending
                .entry(fingerprint.to_string())
                .or_default()
                .insert(id);
        }
    }

    /// Forget a job that left `new` status.
    pub fn release(&mut self, fingerprint: Option<&str>, id: JobId) {
        let Some(fingerprint) = fingerprint else {
            return;
        };
        if let Some(ids) = self.pending.get_mut(fingerprint) {
            ids.remove(&id);
            if ids.is_empty() {
                self.pending.remove(fingerprint);
            }
        }
    }

    /// The oldest pending job holding `fingerprint`.
    pub fn holder(&self, fingerprint: &str) -> Option<JobId> {
        self.pending
            .get(fingerprint)
            .and_then(|ids| ids.iter().next().copied())
    }

    /// Number of pending jobs holding `fingerprint`.
    pub fn pending_count(&self, fingerprint: &str) -> usize {
        self.pending.get(fingerprint).map_or(0, BTreeSet::len)
    }
}
