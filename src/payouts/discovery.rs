use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult, PayoutError};
use crate::ledger::models::{BatchStatus, PaymentBatch, Provider};
use crate::ledger::repository::LedgerRepository;

/// Status for a newly created batch in a period: once a batch for the
/// period has already settled with the provider it may never be reused, so
/// later-arriving entries open a `late` batch instead.
pub fn status_for_new_batch(latest: Option<&PaymentBatch>) -> BatchStatus {
    match latest {
        Some(batch) if batch.is_settled() => BatchStatus::Late,
        _ => BatchStatus::Pending,
    }
}

/// One discovered-or-reused batch and the number of entries attached to it
#[derive(Debug, Serialize)]
pub struct DiscoveredBatch {
    pub batch_id: Uuid,
    pub period_id: Uuid,
    pub status: BatchStatus,
    pub attached: u64,
}

/// Groups eligible pending entries into provider batches. Safe to run any
/// number of times: entries are attached under row locks and an attached
/// entry is never re-attached.
pub struct BatchDiscoveryService {
    ledger: Arc<LedgerRepository>,
}

impl BatchDiscoveryService {
    pub fn new(ledger: Arc<LedgerRepository>) -> Self {
        Self { ledger }
    }

    /// Sweep all periods with eligible entries, creating or reusing one
    /// open batch per (period, provider)
    pub async fn auto_discover(
        &self,
        provider: Provider,
        initiated_by: Option<Uuid>,
    ) -> AppResult<Vec<DiscoveredBatch>> {
        let period_ids = self.ledger.periods_with_eligible_entries().await?;
        let mut discovered = Vec::new();

        for period_id in period_ids {
            if let Some(found) = self
                .discover_for_period(provider, period_id, initiated_by)
                .await?
            {
                discovered.push(found);
            }
        }

        info!(
            "Batch discovery finished | provider={} batches={}",
            provider,
            discovered.len()
        );

        Ok(discovered)
    }

    /// Explicit batch creation for one period. Errors when the period has
    /// no eligible entries.
    pub async fn create_batch_for_period(
        &self,
        provider: Provider,
        period_id: Uuid,
        initiated_by: Option<Uuid>,
    ) -> AppResult<DiscoveredBatch> {
        if self.ledger.get_period(period_id).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "Payment period not found: {}",
                period_id
            )));
        }

        match self
            .discover_for_period(provider, period_id, initiated_by)
            .await?
        {
            Some(found) => Ok(found),
            None => Err(PayoutError::NoEligibleTransactions(period_id).into()),
        }
    }

    /// Attach the period's eligible entries to an open batch, creating one
    /// when none exists. Returns None when nothing was attached and no open
    /// batch had entries (a speculatively created batch is deleted again).
    async fn discover_for_period(
        &self,
        provider: Provider,
        period_id: Uuid,
        initiated_by: Option<Uuid>,
    ) -> AppResult<Option<DiscoveredBatch>> {
        let (batch, created_now) =
            match self.ledger.open_batch_for_period(period_id, provider).await? {
                Some(open) => (open, false),
                None => {
                    let latest = self
                        .ledger
                        .latest_batch_for_period(period_id, provider)
                        .await?;
                    let status = status_for_new_batch(latest.as_ref());

                    let note = match status {
                        BatchStatus::Late => Some("late batch: period already settled"),
                        _ => None,
                    };

                    let batch = self
                        .ledger
                        .create_batch(provider, period_id, initiated_by, status, note)
                        .await?;
                    (batch, true)
                }
            };

        let attached = self
            .ledger
            .attach_eligible_entries(batch.id, period_id)
            .await?;

        if attached == 0 && created_now {
            self.ledger.delete_empty_batch(batch.id).await?;
            return Ok(None);
        }

        info!(
            "Discovered batch {} | period={} status={} attached={}",
            batch.reference,
            period_id,
            batch.status.as_str(),
            attached
        );

        Ok(Some(DiscoveredBatch {
            batch_id: batch.id,
            period_id,
            status: batch.status,
            attached,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn batch(status: BatchStatus, provider_reference: Option<&str>) -> PaymentBatch {
        PaymentBatch {
            id: Uuid::new_v4(),
            reference: "ref".into(),
            provider: Provider::Paystack,
            period_id: Uuid::new_v4(),
            user_id: None,
            total_amount: Decimal::ZERO,
            status,
            provider_reference: provider_reference.map(str::to_string),
            note: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_batch_for_period_is_pending() {
        assert_eq!(status_for_new_batch(None), BatchStatus::Pending);
    }

    #[test]
    fn test_settled_period_opens_late_batch() {
        let settled = batch(BatchStatus::Completed, Some("BULK_1"));
        assert_eq!(status_for_new_batch(Some(&settled)), BatchStatus::Late);

        let partial = batch(BatchStatus::Partial, Some("BULK_2"));
        assert_eq!(status_for_new_batch(Some(&partial)), BatchStatus::Late);
    }

    #[test]
    fn test_unsettled_prior_batch_stays_pending() {
        // failed without ever reaching the provider: a fresh pending batch
        let failed = batch(BatchStatus::Failed, None);
        assert_eq!(status_for_new_batch(Some(&failed)), BatchStatus::Pending);

        // completed but no provider reference recorded
        let odd = batch(BatchStatus::Completed, None);
        assert_eq!(status_for_new_batch(Some(&odd)), BatchStatus::Pending);
    }
}
