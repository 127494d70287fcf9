use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppResult, PayoutError};
use crate::ledger::models::{split_net, TransactionStatus, TransactionType};
use crate::ledger::repository::{LedgerRepository, NewWalletTransaction};

/// Date the payout anchors to: the job's assignment date, falling back to
/// today for jobs that were never formally assigned
pub fn period_anchor_date(assigned_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> NaiveDate {
    assigned_at.unwrap_or(now).date_naive()
}

/// The ONLY place payout intents are created.
///
/// Idempotent: an active (pending or in_progress) entry for the same
/// (job, user, type) blocks a duplicate, so job-completion events can be
/// delivered any number of times.
pub struct PayoutIntentService {
    ledger: Arc<LedgerRepository>,
}

impl PayoutIntentService {
    pub fn new(ledger: Arc<LedgerRepository>) -> Self {
        Self { ledger }
    }

    /// Create payout intents for a completed job, one per freelancer.
    /// Returns the number of entries created.
    pub async fn create_for_completed_job(
        &self,
        job_id: Uuid,
        freelancer_ids: &[Uuid],
    ) -> AppResult<u32> {
        let Some(job) = self.ledger.get_job(job_id).await? else {
            return Err(crate::error::AppError::NotFound(format!(
                "Job not found: {}",
                job_id
            )));
        };

        if !job.is_completed() {
            debug!("Job {} not completed, skipping payout intents", job_id);
            return Ok(0);
        }

        if freelancer_ids.is_empty() {
            warn!("Job {} has no assigned freelancers", job_id);
            return Ok(0);
        }

        let rate = self
            .ledger
            .current_rate()
            .await?
            .ok_or(PayoutError::NoRateConfigured)?;

        // Amounts frozen now; a later rate change never touches this entry
        let gross = job.price;
        let fee = rate.fee_on(gross);
        let net = gross - fee;
        let per_freelancer = split_net(net, freelancer_ids.len() as u32);

        let anchor = period_anchor_date(job.assigned_at, Utc::now());
        let period = self.ledger.get_or_create_weekly_period(anchor).await?;

        let mut created = 0u32;

        for &user_id in freelancer_ids {
            let exists = self
                .ledger
                .active_entry_exists(job_id, user_id, TransactionType::PaymentProcessing)
                .await?;

            if exists {
                info!(
                    "Payout intent already exists | job={} user={}",
                    job_id, user_id
                );
                continue;
            }

            self.ledger
                .create_transaction(NewWalletTransaction {
                    user_id,
                    job_id: Some(job_id),
                    transaction_type: TransactionType::PaymentProcessing,
                    provider: None,
                    gross_amount: Some(gross),
                    fee_amount: Some(fee),
                    amount: per_freelancer,
                    status: TransactionStatus::Pending,
                    rate_id: Some(rate.id),
                    rate_percentage: Some(rate.percentage),
                    payment_period_id: Some(period.id),
                })
                .await?;

            created += 1;
            info!(
                "Created payout intent | job={} user={} amount={}",
                job_id, user_id, per_freelancer
            );
        }

        Ok(created)
    }

    /// Record a job assignment as an in_progress marker entry. Returns true
    /// when an entry was created, false when one already exists.
    pub async fn record_job_assignment(&self, job_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let Some(job) = self.ledger.get_job(job_id).await? else {
            return Err(crate::error::AppError::NotFound(format!(
                "Job not found: {}",
                job_id
            )));
        };

        let exists = self
            .ledger
            .active_entry_exists(job_id, user_id, TransactionType::JobPicked)
            .await?;

        if exists {
            return Ok(false);
        }

        self.ledger
            .create_transaction(NewWalletTransaction {
                user_id,
                job_id: Some(job_id),
                transaction_type: TransactionType::JobPicked,
                provider: None,
                gross_amount: None,
                fee_amount: None,
                amount: job.price,
                status: TransactionStatus::InProgress,
                rate_id: None,
                rate_percentage: None,
                payment_period_id: None,
            })
            .await?;

        info!("Recorded job assignment | job={} user={}", job_id, user_id);
        Ok(true)
    }

    /// Unassignment cancels the user's active entries for the job so they
    /// can never be batched or dispatched. Returns the count cancelled.
    pub async fn cancel_for_unassignment(&self, job_id: Uuid, user_id: Uuid) -> AppResult<u64> {
        let cancelled = self.ledger.cancel_active_entries(job_id, user_id).await?;

        if cancelled > 0 {
            info!(
                "Cancelled {} active entries | job={} user={}",
                cancelled, job_id, user_id
            );
        }

        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_anchor_prefers_assignment_date() {
        let assigned = Utc.with_ymd_and_hms(2024, 6, 5, 14, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();

        assert_eq!(
            period_anchor_date(Some(assigned), now),
            NaiveDate::from_ymd_opt(2024, 6, 5).unwrap()
        );
        assert_eq!(
            period_anchor_date(None, now),
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
        );
    }
}
