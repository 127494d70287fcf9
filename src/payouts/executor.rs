use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{AppResult, GatewayError, PayoutError};
use crate::gateways::registry::GatewayRegistry;
use crate::gateways::traits::BulkPayoutOutcome;
use crate::ledger::models::{BatchStatus, Provider, WalletTransaction};
use crate::ledger::repository::LedgerRepository;
use crate::payouts::finalizer::BatchFinalizer;

/// Result of a batch dispatch, returned to the caller and logged
#[derive(Debug, Serialize)]
pub struct DispatchSummary {
    pub batch_id: Uuid,
    pub reference: String,
    pub provider_reference: Option<String>,
    pub dispatched: usize,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Serialize)]
pub struct SkippedEntry {
    pub transaction_id: Uuid,
    pub reason: String,
}

/// Why a claimed batch cannot proceed to commit. Any failure after the
/// claim must mark the batch failed, or it stays processing forever.
pub fn bulk_failure_reason(outcome: &BulkPayoutOutcome) -> Option<String> {
    if !outcome.success {
        Some(
            outcome
                .error
                .clone()
                .unwrap_or_else(|| "bulk payout rejected".to_string()),
        )
    } else if outcome.provider_batch_ref.is_none() {
        Some("provider batch reference missing from response".to_string())
    } else {
        None
    }
}

/// Dispatches batches and single entries through the gateway layer.
///
/// The external call is never made inside an open database transaction:
/// pre-flight claims the batch (or entry) under a row lock and commits, the
/// provider call happens with no transaction open, and the outcome is
/// committed afterwards. Every error path after the claim marks the batch
/// failed so nothing is left stuck in processing; entries skipped before
/// the provider call are marked failed and picked up by the finalizer.
pub struct BatchExecutor {
    ledger: Arc<LedgerRepository>,
    registry: Arc<GatewayRegistry>,
    finalizer: BatchFinalizer,
}

impl BatchExecutor {
    pub fn new(ledger: Arc<LedgerRepository>, registry: Arc<GatewayRegistry>) -> Self {
        let finalizer = BatchFinalizer::new(Arc::clone(&ledger));
        Self {
            ledger,
            registry,
            finalizer,
        }
    }

    pub async fn dispatch_batch(&self, batch_id: Uuid) -> AppResult<DispatchSummary> {
        // ---- pre-flight: claim the batch under a row lock ----
        let mut tx = self.ledger.begin_tx().await?;

        let batch = self.ledger.lock_batch_for_dispatch(&mut tx, batch_id).await?;
        let member_ids = self.ledger.lock_pending_member_ids(&mut tx, batch_id).await?;

        if member_ids.is_empty() {
            return Err(PayoutError::EmptyBatch(batch_id).into());
        }

        // Claiming the batch now makes a concurrent dispatch fail pre-flight
        self.ledger
            .update_batch_status(&mut tx, batch_id, BatchStatus::Processing, None)
            .await?;

        tx.commit().await?;

        let entries = self.ledger.pending_batch_members(batch_id).await?;
        let gateway = self.registry.get(batch.provider)?;

        // ---- external call, no transaction open ----
        let outcome = match gateway.bulk_payout_batch(&batch, &entries).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Batch {} dispatch errored: {}", batch.reference, err);
                self.ledger
                    .mark_batch_failed(batch_id, &err.to_string())
                    .await?;
                return Err(err);
            }
        };

        if let Some(reason) = bulk_failure_reason(&outcome) {
            error!("Batch {} dispatch failed: {}", batch.reference, reason);
            self.ledger.mark_batch_failed(batch_id, &reason).await?;
            return Err(if outcome.success {
                GatewayError::MalformedResponse("provider batch reference".into()).into()
            } else {
                GatewayError::Permanent {
                    provider: batch.provider,
                    message: reason,
                }
                .into()
            });
        }

        let provider_reference = outcome
            .provider_batch_ref
            .clone()
            .ok_or_else(|| GatewayError::MalformedResponse("provider batch reference".into()))?;

        // ---- commit success state ----
        let skipped_ids: Vec<Uuid> = outcome.skipped.iter().map(|(id, _)| *id).collect();
        let dispatched_ids: Vec<Uuid> = member_ids
            .iter()
            .copied()
            .filter(|id| !skipped_ids.contains(id))
            .collect();

        self.ledger
            .commit_batch_dispatch(batch_id, &provider_reference, &dispatched_ids)
            .await?;

        // entries rejected before the provider call are permanent failures:
        // no webhook will ever arrive for them
        for (id, reason) in &outcome.skipped {
            self.ledger.mark_entry_failed(*id, reason).await?;
        }
        if !outcome.skipped.is_empty() {
            self.finalizer.finalize(batch_id).await?;
        }

        info!(
            "Batch payout started | batch={} provider_ref={} dispatched={} skipped={}",
            batch.reference,
            provider_reference,
            dispatched_ids.len(),
            skipped_ids.len()
        );

        Ok(DispatchSummary {
            batch_id,
            reference: batch.reference,
            provider_reference: Some(provider_reference),
            dispatched: dispatched_ids.len(),
            skipped: outcome
                .skipped
                .into_iter()
                .map(|(transaction_id, reason)| SkippedEntry {
                    transaction_id,
                    reason,
                })
                .collect(),
        })
    }

    /// Fire-and-forget dispatch for long-running bulk calls. Errors land in
    /// the log and the batch's failed state, not in the HTTP response.
    pub fn dispatch_batch_async(self: &Arc<Self>, batch_id: Uuid) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = executor.dispatch_batch(batch_id).await {
                error!("Async batch dispatch failed | batch={}: {}", batch_id, err);
            }
        });
    }

    /// Pay one pending entry directly, outside any batch. Pre-flight claims
    /// the entry (pending -> in_progress) before the provider call, so a
    /// concurrent dispatch of the same entry is rejected in pre-flight.
    pub async fn dispatch_single(
        &self,
        transaction_id: Uuid,
        provider: Provider,
    ) -> AppResult<WalletTransaction> {
        let mut tx = self.ledger.begin_tx().await?;
        let entry = self
            .ledger
            .claim_transaction_for_dispatch(&mut tx, transaction_id)
            .await?;
        tx.commit().await?;

        let gateway = self.registry.get(provider)?;

        let outcome = match gateway.payout(&entry, None).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // release the claim into failed so the retry sweep picks it
                // up instead of leaving it in_progress
                self.ledger
                    .record_single_dispatch_outcome(transaction_id, false, None, provider)
                    .await?;
                return Err(err);
            }
        };

        if !outcome.success {
            info!(
                "Single dispatch failed | tx={} reason={:?}",
                transaction_id, outcome.error
            );
        }

        let updated = self
            .ledger
            .record_single_dispatch_outcome(
                transaction_id,
                outcome.success,
                outcome.provider_ref.as_deref(),
                provider,
            )
            .await?;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::TransactionStatus;

    #[test]
    fn test_dispatched_ids_exclude_skipped() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let member_ids = vec![a, b, c];
        let skipped_ids = vec![b];

        let dispatched: Vec<Uuid> = member_ids
            .iter()
            .copied()
            .filter(|id| !skipped_ids.contains(id))
            .collect();

        assert_eq!(dispatched, vec![a, c]);
    }

    #[test]
    fn test_bulk_failure_reason_for_rejected_call() {
        let outcome = BulkPayoutOutcome {
            success: false,
            provider_batch_ref: None,
            raw: serde_json::json!({}),
            error: Some("insufficient balance".into()),
            skipped: vec![],
        };
        assert_eq!(
            bulk_failure_reason(&outcome),
            Some("insufficient balance".into())
        );

        let no_detail = BulkPayoutOutcome {
            success: false,
            provider_batch_ref: None,
            raw: serde_json::json!({}),
            error: None,
            skipped: vec![],
        };
        assert_eq!(
            bulk_failure_reason(&no_detail),
            Some("bulk payout rejected".into())
        );
    }

    #[test]
    fn test_bulk_failure_reason_for_missing_batch_ref() {
        let outcome = BulkPayoutOutcome {
            success: true,
            provider_batch_ref: None,
            raw: serde_json::json!({"status": true}),
            error: None,
            skipped: vec![],
        };
        assert!(bulk_failure_reason(&outcome)
            .unwrap()
            .contains("batch reference"));
    }

    #[test]
    fn test_bulk_failure_reason_for_accepted_call() {
        let outcome = BulkPayoutOutcome {
            success: true,
            provider_batch_ref: Some("BULK_1".into()),
            raw: serde_json::json!({}),
            error: None,
            skipped: vec![(Uuid::new_v4(), "no_recipient".into())],
        };
        assert_eq!(bulk_failure_reason(&outcome), None);
    }

    #[test]
    fn test_single_dispatch_claim_blocks_a_second_attempt() {
        // pre-flight asserts pending; the claim flips the entry to
        // in_progress, so a concurrent dispatch of the same entry cannot
        // pass pre-flight and reach the provider twice
        let claimed = TransactionStatus::InProgress;
        assert_ne!(claimed, TransactionStatus::Pending);
        assert!(claimed.is_active());
        assert!(!claimed.is_terminal());
    }

    #[test]
    fn test_summary_serializes() {
        let summary = DispatchSummary {
            batch_id: Uuid::nil(),
            reference: "abc".into(),
            provider_reference: Some("BULK_1".into()),
            dispatched: 2,
            skipped: vec![SkippedEntry {
                transaction_id: Uuid::nil(),
                reason: "no_recipient".into(),
            }],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["dispatched"], 2);
        assert_eq!(json["skipped"][0]["reason"], "no_recipient");
    }
}
