use super::{Job, JobContext, JobReport, JobResult};
use async_trait::async_trait;
use chrono::Utc;
use pitchside_shared::ledger;
use std::time::Duration;

/// Pushes pending and retry-due ledger entries to Xero
///
/// Entries that exhaust their attempts raise a critical alert inside the pass.
pub struct LedgerSyncJob {
    interval: Duration,
}

impl LedgerSyncJob {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Job for LedgerSyncJob {
    fn name(&self) -> &'static str {
        "ledger_sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, ctx: &JobContext) -> JobResult<JobReport> {
        let Some(client) = ctx.integrations.ledger.as_deref() else {
            return Ok(JobReport::Skipped);
        };

        let report = ledger::sync_due(
            &ctx.db,
            client,
            ctx.integrations.alerts.as_ref(),
            ctx.batch_size,
            Utc::now(),
        )
        .await?;

        if report.failed > 0 {
            tracing::warn!(failed = report.failed, "Ledger entries permanently failed");
        }

        Ok(JobReport::LedgerSync(report))
    }
}
