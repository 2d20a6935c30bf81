use super::{Job, JobContext, JobReport, JobResult};
use async_trait::async_trait;
use chrono::Utc;
use pitchside_shared::checkout;
use std::time::Duration;

/// Releases reservations past their hold and cancels the unpaid intents behind them
pub struct ReservationExpiryJob {
    interval: Duration,
}

impl ReservationExpiryJob {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Job for ReservationExpiryJob {
    fn name(&self) -> &'static str {
        "reservation_expiry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, ctx: &JobContext) -> JobResult<JobReport> {
        let report = checkout::expire_reservations(&ctx.db, &ctx.integrations, Utc::now()).await?;

        Ok(JobReport::ReservationExpiry(report))
    }
}
