/// Worker configuration
///
/// # Environment Variables
///
/// - `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS`: see [`DatabaseConfig`]
/// - Stripe, Xero, email and alert settings, see [`pitchside_shared::config`]
/// - `LEDGER_SYNC_INTERVAL_SECS` (default: 60)
/// - `EMAIL_RETRY_INTERVAL_SECS` (default: 120)
/// - `PAYMENT_PLAN_INTERVAL_SECS` (default: 3600)
/// - `RESERVATION_EXPIRY_INTERVAL_SECS` (default: 60)
/// - `JOB_BATCH_SIZE`: Rows claimed per pass (default: 25)

use pitchside_shared::config::{parse_or, IntegrationsConfig};
use pitchside_shared::db::pool::DatabaseConfig;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: i64 = 25;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database: DatabaseConfig,
    pub integrations: IntegrationsConfig,
    pub jobs: JobSchedule,
}

/// How often each job runs and how much it takes on per pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSchedule {
    pub ledger_sync_interval_secs: u64,
    pub email_retry_interval_secs: u64,
    pub payment_plan_interval_secs: u64,
    pub reservation_expiry_interval_secs: u64,
    pub batch_size: i64,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self {
            ledger_sync_interval_secs: 60,
            email_retry_interval_secs: 120,
            payment_plan_interval_secs: 3600,
            reservation_expiry_interval_secs: 60,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl JobSchedule {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let schedule = Self {
            ledger_sync_interval_secs: parse_or("LEDGER_SYNC_INTERVAL_SECS", defaults.ledger_sync_interval_secs)?,
            email_retry_interval_secs: parse_or("EMAIL_RETRY_INTERVAL_SECS", defaults.email_retry_interval_secs)?,
            payment_plan_interval_secs: parse_or("PAYMENT_PLAN_INTERVAL_SECS", defaults.payment_plan_interval_secs)?,
            reservation_expiry_interval_secs: parse_or(
                "RESERVATION_EXPIRY_INTERVAL_SECS",
                defaults.reservation_expiry_interval_secs,
            )?,
            batch_size: parse_or("JOB_BATCH_SIZE", defaults.batch_size)?,
        };
        schedule.validate()?;

        Ok(schedule)
    }

    /// Every interval must be at least one second and the batch must be positive
    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("LEDGER_SYNC_INTERVAL_SECS", self.ledger_sync_interval_secs),
            ("EMAIL_RETRY_INTERVAL_SECS", self.email_retry_interval_secs),
            ("PAYMENT_PLAN_INTERVAL_SECS", self.payment_plan_interval_secs),
            ("RESERVATION_EXPIRY_INTERVAL_SECS", self.reservation_expiry_interval_secs),
        ];

        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            anyhow::bail!("{} must be at least 1", name);
        }

        if self.batch_size < 1 {
            anyhow::bail!("JOB_BATCH_SIZE must be at least 1");
        }

        Ok(())
    }

    pub fn ledger_sync_interval(&self) -> Duration {
        Duration::from_secs(self.ledger_sync_interval_secs)
    }

    pub fn email_retry_interval(&self) -> Duration {
        Duration::from_secs(self.email_retry_interval_secs)
    }

    pub fn payment_plan_interval(&self) -> Duration {
        Duration::from_secs(self.payment_plan_interval_secs)
    }

    pub fn reservation_expiry_interval(&self) -> Duration {
        Duration::from_secs(self.reservation_expiry_interval_secs)
    }
}

impl WorkerConfig {
    /// Loads configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` or a required vendor setting is missing, or a
    /// schedule value does not parse or is zero.
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present (for development)
        dotenvy::dotenv().ok();

        Ok(Self {
            database: DatabaseConfig::from_env()?,
            integrations: IntegrationsConfig::from_env()?,
            jobs: JobSchedule::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        let schedule = JobSchedule::default();
        assert_eq!(schedule.ledger_sync_interval(), Duration::from_secs(60));
        assert_eq!(schedule.email_retry_interval(), Duration::from_secs(120));
        assert_eq!(schedule.payment_plan_interval(), Duration::from_secs(3600));
        assert_eq!(schedule.reservation_expiry_interval(), Duration::from_secs(60));
        assert_eq!(schedule.batch_size, 25);
        assert!(schedule.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let schedule = JobSchedule {
            email_retry_interval_secs: 0,
            ..Default::default()
        };
        let err = schedule.validate().unwrap_err();
        assert!(err.to_string().contains("EMAIL_RETRY_INTERVAL_SECS"));
    }

    #[test]
    fn test_batch_must_be_positive() {
        let schedule = JobSchedule {
            batch_size: 0,
            ..Default::default()
        };
        assert!(schedule.validate().is_err());
    }
}
