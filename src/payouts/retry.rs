use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, PayoutError};
use crate::gateways::registry::GatewayRegistry;
use crate::ledger::models::TransactionStatus;
use crate::ledger::repository::{LedgerRepository, NewPayoutLog, TransferOutcomeApply};
use crate::payouts::finalizer::BatchFinalizer;

/// Permanent retry ceiling per entry
pub const MAX_RETRIES: i32 = 3;

/// One settled line item lifted out of a provider's bulk-status response
#[derive(Debug, Clone, PartialEq)]
pub struct BulkTransferItem {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub transfer_code: Option<String>,
    pub raw: serde_json::Value,
}

/// Map a provider transfer state onto a terminal ledger status. None means
/// still in flight, leave the entry alone.
pub fn map_transfer_status(provider_status: &str) -> Option<TransactionStatus> {
    match provider_status {
        "success" => Some(TransactionStatus::Completed),
        "failed" | "reversed" => Some(TransactionStatus::Failed),
        _ => None,
    }
}

/// Pull the settled line items out of a bulk-status response. Transfers are
/// matched back to ledger entries by the per-transfer reference written at
/// dispatch time ("{batch_reference}:{transaction_id}"); anything else in
/// the response is ignored.
pub fn parse_bulk_transfers(raw: &serde_json::Value, batch_reference: &str) -> Vec<BulkTransferItem> {
    let prefix = format!("{}:", batch_reference);

    raw["data"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| {
            let reference = item["reference"].as_str()?;
            let tx_id: Uuid = reference.strip_prefix(&prefix)?.parse().ok()?;
            let status = map_transfer_status(item["status"].as_str()?)?;

            Some(BulkTransferItem {
                transaction_id: tx_id,
                status,
                transfer_code: item["transfer_code"].as_str().map(str::to_string),
                raw: item.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Default, Serialize)]
pub struct SweepSummary {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileSummary {
    pub updated: u32,
    pub duplicates: u32,
    pub unmatched: u32,
    pub batch_status: Option<String>,
}

/// Periodic safety nets: the retry sweep re-dispatches failed entries below
/// the retry ceiling, and bulk reconciliation polls the provider for
/// transfers whose webhooks were missed.
pub struct RetryService {
    ledger: Arc<LedgerRepository>,
    registry: Arc<GatewayRegistry>,
    finalizer: BatchFinalizer,
}

impl RetryService {
    pub fn new(ledger: Arc<LedgerRepository>, registry: Arc<GatewayRegistry>) -> Self {
        let finalizer = BatchFinalizer::new(Arc::clone(&ledger));
        Self {
            ledger,
            registry,
            finalizer,
        }
    }

    /// One pass over failed entries still below the retry ceiling. Each
    /// attempt increments the counter whatever the outcome, so an entry is
    /// retried at most MAX_RETRIES times, ever.
    pub async fn sweep(&self) -> AppResult<SweepSummary> {
        let ids = self.ledger.failed_retryable_ids(MAX_RETRIES).await?;
        let mut summary = SweepSummary::default();

        for id in ids {
            let Some(entry) = self.ledger.get_transaction(id).await? else {
                continue;
            };

            // Terminal-but-retryable is exactly `failed`; anything else was
            // touched since the id list was read
            if entry.status != TransactionStatus::Failed {
                continue;
            }

            let Some(provider) = entry.provider else {
                warn!("Entry {} has no provider recorded, cannot retry", id);
                summary.skipped += 1;
                continue;
            };

            let gateway = self.registry.get(provider)?;

            // A fresh key per attempt: the provider must treat this as a new
            // transfer, not replay the failed one
            let key = format!("retry-{}-attempt-{}", id, entry.retry_count + 1);

            summary.attempted += 1;
            let outcome = gateway.payout(&entry, Some(key)).await?;

            let updated = self
                .ledger
                .record_retry_outcome(id, outcome.success, outcome.provider_ref.as_deref())
                .await?;

            if outcome.success {
                summary.succeeded += 1;
                info!("Retry succeeded | tx={} retries={}", id, updated.retry_count);
            } else {
                summary.failed += 1;
                info!(
                    "Retry failed | tx={} retries={} reason={:?}",
                    id, updated.retry_count, outcome.error
                );
            }

            if let Some(batch_id) = entry.batch_id {
                self.finalizer.finalize(batch_id).await?;
            }
        }

        info!(
            "Retry sweep finished | attempted={} succeeded={} failed={} skipped={}",
            summary.attempted, summary.succeeded, summary.failed, summary.skipped
        );

        Ok(summary)
    }

    /// Poll the provider for a dispatched batch's transfer states and apply
    /// any terminal outcomes the webhooks never delivered. Idempotent:
    /// already-terminal entries count as duplicates and stay untouched.
    pub async fn reconcile_batch(&self, batch_id: Uuid) -> AppResult<ReconcileSummary> {
        let batch = self
            .ledger
            .get_batch(batch_id)
            .await?
            .ok_or(PayoutError::BatchNotFound(batch_id))?;

        let Some(provider_reference) = batch.provider_reference.clone() else {
            return Err(AppError::BadRequest(format!(
                "Batch {} was never dispatched, nothing to reconcile",
                batch.reference
            )));
        };

        let gateway = self.registry.get(batch.provider)?;
        let raw = gateway.fetch_bulk_status(&provider_reference).await?;

        self.ledger
            .insert_log(NewPayoutLog {
                provider: batch.provider,
                endpoint: "bulk_status".to_string(),
                wallet_transaction_id: None,
                batch_id: Some(batch.id),
                request_payload: serde_json::json!({ "provider_reference": provider_reference }),
                response_payload: raw.clone(),
                status_code: None,
                idempotency_key: None,
                error: None,
            })
            .await?;

        let items = parse_bulk_transfers(&raw, &batch.reference);
        let member_ids: Vec<Uuid> = self
            .ledger
            .transactions_in_batch(batch_id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let mut summary = ReconcileSummary::default();

        for item in items {
            if !member_ids.contains(&item.transaction_id) {
                warn!(
                    "Bulk status names transfer outside batch {} | tx={}",
                    batch.reference, item.transaction_id
                );
                summary.unmatched += 1;
                continue;
            }

            let applied = self
                .ledger
                .reconcile_entry(
                    item.transaction_id,
                    item.status,
                    batch.provider,
                    item.transfer_code.as_deref(),
                    item.raw,
                )
                .await?;

            match applied {
                TransferOutcomeApply::Applied(_) => summary.updated += 1,
                TransferOutcomeApply::Duplicate(_) => summary.duplicates += 1,
                TransferOutcomeApply::NotFound => summary.unmatched += 1,
            }
        }

        let status = self.finalizer.finalize(batch_id).await?;
        summary.batch_status = Some(status.as_str().to_string());

        info!(
            "Reconciled batch {} | updated={} duplicates={} unmatched={} status={}",
            batch.reference,
            summary.updated,
            summary.duplicates,
            summary.unmatched,
            status.as_str()
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(map_transfer_status("success"), Some(TransactionStatus::Completed));
        assert_eq!(map_transfer_status("failed"), Some(TransactionStatus::Failed));
        assert_eq!(map_transfer_status("reversed"), Some(TransactionStatus::Failed));
        assert_eq!(map_transfer_status("pending"), None);
        assert_eq!(map_transfer_status("otp"), None);
        assert_eq!(map_transfer_status(""), None);
    }

    #[test]
    fn test_parse_bulk_transfers_matches_by_reference() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let raw = json!({
            "status": true,
            "data": [
                {
                    "reference": format!("batchref:{}", a),
                    "status": "success",
                    "transfer_code": "TRF_a",
                },
                {
                    "reference": format!("batchref:{}", b),
                    "status": "failed",
                    "transfer_code": "TRF_b",
                },
                // still in flight, no terminal outcome yet
                {
                    "reference": format!("batchref:{}", Uuid::new_v4()),
                    "status": "pending",
                },
                // foreign reference, ignored
                { "reference": "otherbatch:xyz", "status": "success" },
                // malformed, ignored
                { "status": "success" },
            ],
        });

        let items = parse_bulk_transfers(&raw, "batchref");
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].transaction_id, a);
        assert_eq!(items[0].status, TransactionStatus::Completed);
        assert_eq!(items[0].transfer_code.as_deref(), Some("TRF_a"));

        assert_eq!(items[1].transaction_id, b);
        assert_eq!(items[1].status, TransactionStatus::Failed);
    }

    #[test]
    fn test_parse_bulk_transfers_handles_empty_response() {
        assert!(parse_bulk_transfers(&json!({}), "ref").is_empty());
        assert!(parse_bulk_transfers(&json!({ "data": [] }), "ref").is_empty());
        assert!(parse_bulk_transfers(&json!(null), "ref").is_empty());
    }
}
