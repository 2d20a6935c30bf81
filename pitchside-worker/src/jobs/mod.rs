/// Periodic jobs
///
/// Each job wraps one batch pass from `pitchside-shared`. A pass claims at most
/// `batch_size` rows and returns a report; the [`Scheduler`](crate::scheduler::Scheduler)
/// decides when passes run.
///
/// | Job | Pass | Needs |
/// |-----|------|-------|
/// | `ledger_sync` | push pending ledger entries to Xero | Xero configured |
/// | `email_retry` | send due outbox emails | email configured |
/// | `payment_plans` | charge due installments off-session | - |
/// | `reservation_expiry` | release lapsed reservations | - |
///
/// A job whose vendor is not configured reports [`JobReport::Skipped`].

mod email_retry;
mod ledger_sync;
mod payment_plans;
mod reservation_expiry;

pub use email_retry::EmailRetryJob;
pub use ledger_sync::LedgerSyncJob;
pub use payment_plans::PaymentPlanJob;
pub use reservation_expiry::ReservationExpiryJob;

use crate::config::JobSchedule;
use async_trait::async_trait;
use pitchside_shared::{
    checkout::{CheckoutError, ExpiryReport},
    integrations::Integrations,
    ledger::SyncReport,
    notifications::OutboxReport,
    payment_plans::PlanReport,
};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// The pass panicked or was aborted
    #[error("Job {job} did not finish: {message}")]
    Aborted { job: &'static str, message: String },
}

pub type JobResult<T> = Result<T, SchedulerError>;

/// What a pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "job", content = "report", rename_all = "snake_case")]
pub enum JobReport {
    /// The vendor this job needs is not configured
    Skipped,
    LedgerSync(SyncReport),
    EmailRetry(OutboxReport),
    PaymentPlans(PlanReport),
    ReservationExpiry(ExpiryReport),
}

impl JobReport {
    /// Rows the pass acted on
    pub fn touched(&self) -> usize {
        match self {
            JobReport::Skipped => 0,
            JobReport::LedgerSync(r) => r.synced + r.deferred + r.retried + r.failed,
            JobReport::EmailRetry(r) => r.sent + r.retrying + r.failed,
            JobReport::PaymentPlans(r) => r.total(),
            JobReport::ReservationExpiry(r) => r.reservations_expired,
        }
    }
}

/// Everything a pass needs
#[derive(Clone)]
pub struct JobContext {
    pub db: PgPool,
    pub integrations: Arc<Integrations>,

    /// Rows claimed per pass
    pub batch_size: i64,
}

impl JobContext {
    pub fn new(db: PgPool, integrations: Integrations, batch_size: i64) -> Self {
        Self {
            db,
            integrations: Arc::new(integrations),
            batch_size,
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    /// Stable name, used in logs and by [`Scheduler::run_once`](crate::scheduler::Scheduler::run_once)
    fn name(&self) -> &'static str;

    /// Time between the starts of consecutive passes
    fn interval(&self) -> Duration;

    /// Runs one pass
    async fn run(&self, ctx: &JobContext) -> JobResult<JobReport>;
}

/// The four built-in jobs on their configured intervals
pub fn default_jobs(schedule: &JobSchedule) -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(LedgerSyncJob::new(schedule.ledger_sync_interval())),
        Arc::new(EmailRetryJob::new(schedule.email_retry_interval())),
        Arc::new(PaymentPlanJob::new(schedule.payment_plan_interval())),
        Arc::new(ReservationExpiryJob::new(schedule.reservation_expiry_interval())),
    ]
}
