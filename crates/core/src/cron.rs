//! Cron emitter: enqueues a job on every tick of a cron schedule.

use chrono::{DateTime, Utc};
use ::cron::Schedule;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::client::Client;
use crate::error::{Result, WqError};
use crate::job::Job;

/// Parse a seconds-first cron expression (6 or 7 fields).
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(WqError::InvalidCron {
            expr: expr.to_string(),
            reason: "expression is empty".to_string(),
        });
    }
    Schedule::from_str(trimmed).map_err(|e| WqError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Queue name used for the jobs of a cron listener.
///
/// Alphanumerics are kept, `*` becomes `s` and every other character `_`,
/// so `"*/5 * * * * *"` maps to `cron.s_5_s_s_s_s_s`.
pub fn cron_queue_name(expr: &str) -> String {
    let sanitized: String = expr
        .trim()
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c,
            '*' => 's',
            _ => '_',
        })
        .collect();
    format!("cron.{}", sanitized)
}

/// Enqueues one job on `queue` at every fire time of `schedule`.
pub struct CronEmitter<B: Backend + Clone + 'static> {
    expr: String,
    schedule: Schedule,
    queue: String,
    client: Client<B>,
    shutdown: CancellationToken,
}

impl<B: Backend + Clone + 'static> CronEmitter<B> {
    /// Create a new emitter.
    pub fn new(
        expr: impl Into<String>,
        schedule: Schedule,
        queue: impl Into<String>,
        client: Client<B>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            expr: expr.into(),
            schedule,
            queue: queue.into(),
            client,
            shutdown,
        }
    }

    /// Run until the shutdown token fires or the schedule has no more fire times.
    pub async fn run(&self) {
        tracing::info!(cron = %self.expr, queue = %self.queue, "Cron emitter started");

        let mut last = Utc::now();
        loop {
            let Some(next) = self.next_fire(last) else {
                tracing::info!(cron = %self.expr, "Cron schedule exhausted");
                break;
            };

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.emit(next).await;
            last = next;
        }

        tracing::info!(cron = %self.expr, queue = %self.queue, "Cron emitter stopped");
    }

    /// First fire time after both `last` and now, so a slow tick skips
    /// missed fires instead of replaying them.
    fn next_fire(&self, last: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = last.max(Utc::now());
        self.schedule.after(&from).next()
    }

    async fn emit(&self, fire_time: DateTime<Utc>) {
        let job = Job::new(self.queue.clone())
            .run_after(fire_time)
            .insert("cron", self.expr.clone())
            .insert("fired_at", fire_time.to_rfc3339());

        match self.client.enqueue(job).await {
            Ok(job_id) => {
                tracing::debug!(cron = %self.expr, job_id = %job_id, "Cron job enqueued");
            }
            Err(e) => {
                tracing::error!(cron = %self.expr, error = %e, "Failed to enqueue cron job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingBackend;

    #[test]
    fn test_parse_every_second() {
        let schedule = parse_schedule("* * * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.after(&now).next().unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::seconds(1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_schedule("every tuesday").unwrap_err();
        assert!(matches!(err, WqError::InvalidCron { .. }));
        assert!(err.to_string().contains("every tuesday"));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            parse_schedule("   "),
            Err(WqError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_cron_queue_name() {
        assert_eq!(cron_queue_name("* * * * * *"), "cron.s_s_s_s_s_s");
        assert_eq!(cron_queue_name("*/5 * * * * *"), "cron.s_5_s_s_s_s_s");
        assert_eq!(cron_queue_name(" 0 30 9 * * MON "), "cron.0_30_9_s_s_MON");
    }

    #[test]
    fn test_next_fire_skips_past_ticks() {
        let schedule = parse_schedule("* * * * * *").unwrap();
        let client = Client::new(RecordingBackend::default());
        let emitter = CronEmitter::new(
            "* * * * * *",
            schedule,
            "cron.s_s_s_s_s_s",
            client,
            CancellationToken::new(),
        );

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        let next = emitter.next_fire(long_ago).unwrap();
        assert!(next > Utc::now() - chrono::Duration::seconds(1));
    }
}
