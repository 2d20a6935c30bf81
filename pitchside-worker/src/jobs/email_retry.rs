use super::{Job, JobContext, JobReport, JobResult};
use async_trait::async_trait;
use chrono::Utc;
use pitchside_shared::notifications;
use std::time::Duration;

/// Sends queued emails whose next attempt is due
pub struct EmailRetryJob {
    interval: Duration,
}

impl EmailRetryJob {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Job for EmailRetryJob {
    fn name(&self) -> &'static str {
        "email_retry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, ctx: &JobContext) -> JobResult<JobReport> {
        let Some(sender) = ctx.integrations.email.as_deref() else {
            return Ok(JobReport::Skipped);
        };

        let report = notifications::process_outbox(&ctx.db, sender, ctx.batch_size, Utc::now()).await?;

        Ok(JobReport::EmailRetry(report))
    }
}
