use super::{Job, JobContext, JobReport, JobResult};
use async_trait::async_trait;
use chrono::Utc;
use pitchside_shared::payment_plans;
use std::time::Duration;

/// Charges due installments against the member's saved card
pub struct PaymentPlanJob {
    interval: Duration,
}

impl PaymentPlanJob {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Job for PaymentPlanJob {
    fn name(&self) -> &'static str {
        "payment_plans"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, ctx: &JobContext) -> JobResult<JobReport> {
        let report = payment_plans::process_due(&ctx.db, &ctx.integrations, Utc::now(), ctx.batch_size).await?;

        if report.declined > 0 {
            tracing::info!(declined = report.declined, "Installment charges declined");
        }

        Ok(JobReport::PaymentPlans(report))
    }
}
