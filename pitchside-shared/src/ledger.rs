/// Ledger sync
///
/// Pushes `pending` ledger entries to the accounting system. An invoice entry becomes
/// an invoice plus, when money was taken, a payment against it. An installment entry
/// only becomes a payment against its parent's invoice, so it waits until the parent
/// has synced.
///
/// Each external document is created with its own idempotency key and its id is saved
/// as soon as it exists, so a retry after a partial sync picks up where it stopped.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::integrations::alerts::{AlertKind, AlertSink, CriticalAlert};
use crate::integrations::xero::{LedgerClient, LedgerError, LedgerInvoice, LedgerPayment};
use crate::models::ledger::{LedgerEntry, LedgerEntryKind, LedgerEntryStatus};
use crate::models::user::User;

/// Wait before checking again whether a parent invoice has synced
const PARENT_WAIT_SECS: i64 = 300;

/// Back off after a rate limit without spending an attempt
const RATE_LIMIT_WAIT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced,
    Deferred,
    Retried,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Synced => self.synced += 1,
            SyncOutcome::Deferred => self.deferred += 1,
            SyncOutcome::Retried => self.retried += 1,
            SyncOutcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.synced + self.deferred + self.retried + self.failed
    }
}

/// Syncs up to `batch` due entries
pub async fn sync_due(
    pool: &PgPool,
    ledger: &dyn LedgerClient,
    alerts: &dyn AlertSink,
    batch: i64,
    now: DateTime<Utc>,
) -> Result<SyncReport, sqlx::Error> {
    let entries = LedgerEntry::claim_due(pool, now, batch).await?;
    let mut report = SyncReport::default();

    for entry in entries {
        match sync_entry(pool, ledger, alerts, &entry, now).await {
            Ok(outcome) => report.record(outcome),
            Err(e) => {
                // Lease runs out and another pass picks it up
                tracing::error!(ledger_entry_id = %entry.id, error = %e, "Ledger sync bookkeeping failed");
            }
        }
    }

    if report.total() > 0 {
        tracing::info!(
            synced = report.synced,
            deferred = report.deferred,
            retried = report.retried,
            failed = report.failed,
            "Ledger sync pass finished"
        );
    }

    Ok(report)
}

/// Syncs one entry right after payment completion
///
/// Whatever happens the entry stays queued for the worker; nothing is returned.
pub async fn sync_one_best_effort(
    pool: &PgPool,
    ledger: &dyn LedgerClient,
    alerts: &dyn AlertSink,
    entry_id: Uuid,
    now: DateTime<Utc>,
) {
    let entry = match LedgerEntry::claim_one(pool, entry_id, now).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(ledger_entry_id = %entry_id, error = %e, "Could not claim ledger entry");
            return;
        }
    };

    match sync_entry(pool, ledger, alerts, &entry, now).await {
        Ok(outcome) => tracing::debug!(ledger_entry_id = %entry_id, ?outcome, "Immediate ledger sync"),
        Err(e) => tracing::warn!(ledger_entry_id = %entry_id, error = %e, "Immediate ledger sync failed"),
    }
}

/// Puts a failed entry back in the queue with a fresh attempt budget
pub async fn retry_failed(pool: &PgPool, entry_id: Uuid, now: DateTime<Utc>) -> Result<Option<LedgerEntry>, sqlx::Error> {
    let entry = LedgerEntry::retry(pool, entry_id, now).await?;
    if entry.is_some() {
        tracing::info!(ledger_entry_id = %entry_id, "Ledger entry queued for retry");
    }
    Ok(entry)
}

/// Syncs one claimed entry and records the result
///
/// Only database errors are returned; ledger errors become a recorded failure.
pub async fn sync_entry(
    pool: &PgPool,
    ledger: &dyn LedgerClient,
    alerts: &dyn AlertSink,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> Result<SyncOutcome, sqlx::Error> {
    let pushed = match entry.kind {
        LedgerEntryKind::Invoice => push_invoice(pool, ledger, entry, now).await,
        LedgerEntryKind::Payment => push_installment(pool, ledger, entry, now).await,
    };

    match pushed {
        Ok(Pushed::Done) => {
            LedgerEntry::mark_synced(pool, entry.id, now).await?;
            tracing::info!(
                ledger_entry_id = %entry.id,
                kind = ?entry.kind,
                total_cents = entry.total_cents,
                "Ledger entry synced"
            );
            Ok(SyncOutcome::Synced)
        }
        Ok(Pushed::WaitingForParent) => {
            LedgerEntry::defer(
                pool,
                entry.id,
                now + Duration::seconds(PARENT_WAIT_SECS),
                "waiting for parent invoice",
            )
            .await?;
            Ok(SyncOutcome::Deferred)
        }
        Err(Failure::Database(e)) => Err(e),
        Err(Failure::Ledger(LedgerError::RateLimited)) => {
            LedgerEntry::defer(
                pool,
                entry.id,
                now + Duration::seconds(RATE_LIMIT_WAIT_SECS),
                "rate limited",
            )
            .await?;
            Ok(SyncOutcome::Deferred)
        }
        Err(Failure::Ledger(e)) => {
            let message = e.to_string();
            let updated = LedgerEntry::record_failure(pool, entry, &message, now).await?;

            match updated {
                Some(updated) if updated.status == LedgerEntryStatus::Failed => {
                    tracing::error!(
                        ledger_entry_id = %entry.id,
                        attempts = updated.attempts,
                        error = %message,
                        "Ledger entry failed permanently"
                    );
                    alerts
                        .critical(&CriticalAlert::new(
                            AlertKind::LedgerSyncFailed,
                            "Ledger entry could not be synced",
                            json!({
                                "ledger_entry_id": entry.id,
                                "payment_id": entry.payment_id,
                                "attempts": updated.attempts,
                                "error": message,
                            }),
                        ))
                        .await;
                    Ok(SyncOutcome::Failed)
                }
                _ => {
                    tracing::warn!(
                        ledger_entry_id = %entry.id,
                        attempt = entry.attempts + 1,
                        error = %message,
                        "Ledger sync failed, will retry"
                    );
                    Ok(SyncOutcome::Retried)
                }
            }
        }
    }
}

enum Pushed {
    Done,
    WaitingForParent,
}

enum Failure {
    Ledger(LedgerError),
    Database(sqlx::Error),
}

impl From<LedgerError> for Failure {
    fn from(err: LedgerError) -> Self {
        Failure::Ledger(err)
    }
}

impl From<sqlx::Error> for Failure {
    fn from(err: sqlx::Error) -> Self {
        Failure::Database(err)
    }
}

async fn push_invoice(
    pool: &PgPool,
    ledger: &dyn LedgerClient,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> Result<Pushed, Failure> {
    let invoice_id = match &entry.external_invoice_id {
        Some(id) => id.clone(),
        None => {
            let contact_id = contact_for(pool, ledger, entry).await?;
            let invoice = build_invoice(entry, contact_id);
            let id = ledger.create_invoice(&invoice, &entry.id.to_string()).await?;
            LedgerEntry::set_external_invoice_id(pool, entry.id, &id).await?;
            id
        }
    };

    if entry.amount_paid_cents > 0 && entry.external_payment_id.is_none() {
        let payment = build_payment(entry, invoice_id, now);
        let id = ledger
            .create_payment(&payment, &entry.payment_idempotency_key())
            .await?;
        LedgerEntry::set_external_payment_id(pool, entry.id, &id).await?;
    }

    Ok(Pushed::Done)
}

async fn push_installment(
    pool: &PgPool,
    ledger: &dyn LedgerClient,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> Result<Pushed, Failure> {
    let Some(parent_id) = entry.parent_id else {
        return Err(Failure::Ledger(LedgerError::Rejected(
            "installment entry has no parent invoice".to_string(),
        )));
    };

    let parent = LedgerEntry::find_by_id(pool, parent_id).await?;
    let Some(invoice_id) = parent.and_then(|p| p.external_invoice_id) else {
        return Ok(Pushed::WaitingForParent);
    };

    if entry.external_payment_id.is_none() {
        let payment = build_payment(entry, invoice_id, now);
        let id = ledger
            .create_payment(&payment, &entry.payment_idempotency_key())
            .await?;
        LedgerEntry::set_external_payment_id(pool, entry.id, &id).await?;
    }

    Ok(Pushed::Done)
}

/// The member's contact id, cached on the user after the first lookup
async fn contact_for(pool: &PgPool, ledger: &dyn LedgerClient, entry: &LedgerEntry) -> Result<String, Failure> {
    let user = User::find_by_id(pool, entry.user_id).await?;
    if let Some(contact_id) = user.as_ref().and_then(|u| u.xero_contact_id.clone()) {
        return Ok(contact_id);
    }

    let contact_id = ledger
        .find_or_create_contact(&entry.contact_name, &entry.contact_email)
        .await?;
    if user.is_some() {
        User::set_xero_contact_id(pool, entry.user_id, &contact_id).await?;
    }
    Ok(contact_id)
}

fn build_invoice(entry: &LedgerEntry, contact_id: String) -> LedgerInvoice {
    let date = entry.created_at.date_naive();
    LedgerInvoice {
        contact_id,
        reference: entry
            .payment_reference
            .clone()
            .unwrap_or_else(|| entry.description.clone()),
        date,
        due_date: date,
        line_items: entry.line_items.0.clone(),
    }
}

fn build_payment(entry: &LedgerEntry, invoice_id: String, now: DateTime<Utc>) -> LedgerPayment {
    LedgerPayment {
        invoice_id,
        amount_cents: entry.amount_paid_cents,
        date: now.date_naive(),
        reference: entry
            .payment_reference
            .clone()
            .unwrap_or_else(|| format!("pitchside-{}", entry.id)),
    }
}
