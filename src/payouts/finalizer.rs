use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppResult, PayoutError};
use crate::ledger::models::BatchStatus;
use crate::ledger::repository::{BatchMemberCounts, LedgerRepository};

/// Decide the batch status implied by its members' statuses. None means no
/// members, nothing to decide.
///
/// A batch is only terminal once no member is still pending or in flight:
/// all succeeded -> completed, a mix -> partial, none succeeded -> failed.
pub fn resolve_batch_status(counts: &BatchMemberCounts) -> Option<BatchStatus> {
    if counts.total == 0 {
        return None;
    }

    let waiting = counts.pending + counts.in_progress;
    if waiting > 0 {
        return Some(BatchStatus::Processing);
    }

    if counts.failed_or_cancelled == 0 {
        Some(BatchStatus::Completed)
    } else if counts.completed > 0 {
        Some(BatchStatus::Partial)
    } else {
        Some(BatchStatus::Failed)
    }
}

/// Whether the batch total must be recomputed from its members. Terminal
/// statuses always recompute: the attach-time running total still counts
/// members cancelled after attachment. A zero total is backfilled for
/// batches created before any entry attached.
pub fn should_recompute_total(current_total: Decimal, new_status: BatchStatus) -> bool {
    new_status.is_terminal() || current_total == Decimal::ZERO
}

/// Recomputes a batch's status from its members. Called after every member
/// transition (webhook, retry, reconcile).
pub struct BatchFinalizer {
    ledger: Arc<LedgerRepository>,
}

impl BatchFinalizer {
    pub fn new(ledger: Arc<LedgerRepository>) -> Self {
        Self { ledger }
    }

    pub async fn finalize(&self, batch_id: Uuid) -> AppResult<BatchStatus> {
        let mut tx = self.ledger.begin_tx().await?;

        let batch = self
            .ledger
            .lock_batch(&mut tx, batch_id)
            .await?
            .ok_or(PayoutError::BatchNotFound(batch_id))?;

        // completed and failed never reopen; partial may still drain to
        // completed through the retry sweep
        if matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed) {
            return Ok(batch.status);
        }

        let counts = self.ledger.member_status_counts(&mut tx, batch_id).await?;

        let Some(new_status) = resolve_batch_status(&counts) else {
            return Ok(batch.status);
        };

        // member_amount_sum excludes cancelled entries, unlike the
        // attach-time running total
        let total = if should_recompute_total(batch.total_amount, new_status) {
            Some(self.ledger.member_amount_sum(&mut tx, batch_id).await?)
        } else {
            None
        };

        self.ledger
            .update_batch_status(&mut tx, batch_id, new_status, total)
            .await?;

        tx.commit().await?;

        match new_status {
            BatchStatus::Completed => {
                info!("Batch {} fully completed", batch.reference)
            }
            BatchStatus::Partial => warn!(
                "Batch {} partial success (completed={}, failed={})",
                batch.reference, counts.completed, counts.failed_or_cancelled
            ),
            BatchStatus::Failed => error!("Batch {} all failed", batch.reference),
            _ => info!(
                "Batch {} still processing (waiting={})",
                batch.reference,
                counts.pending + counts.in_progress
            ),
        }

        Ok(new_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(
        pending: i64,
        in_progress: i64,
        completed: i64,
        failed_or_cancelled: i64,
    ) -> BatchMemberCounts {
        BatchMemberCounts {
            total: pending + in_progress + completed + failed_or_cancelled,
            pending,
            in_progress,
            completed,
            failed_or_cancelled,
        }
    }

    #[test]
    fn test_empty_batch_resolves_to_nothing() {
        assert_eq!(resolve_batch_status(&counts(0, 0, 0, 0)), None);
    }

    #[test]
    fn test_in_flight_members_keep_batch_processing() {
        assert_eq!(
            resolve_batch_status(&counts(2, 0, 0, 0)),
            Some(BatchStatus::Processing)
        );
        assert_eq!(
            resolve_batch_status(&counts(0, 3, 1, 1)),
            Some(BatchStatus::Processing)
        );
        // one straggler is enough
        assert_eq!(
            resolve_batch_status(&counts(0, 1, 9, 0)),
            Some(BatchStatus::Processing)
        );
    }

    #[test]
    fn test_all_completed_is_completed() {
        assert_eq!(
            resolve_batch_status(&counts(0, 0, 5, 0)),
            Some(BatchStatus::Completed)
        );
    }

    #[test]
    fn test_mixed_outcome_is_partial() {
        assert_eq!(
            resolve_batch_status(&counts(0, 0, 3, 2)),
            Some(BatchStatus::Partial)
        );
        assert_eq!(
            resolve_batch_status(&counts(0, 0, 1, 9)),
            Some(BatchStatus::Partial)
        );
    }

    #[test]
    fn test_no_successes_is_failed() {
        assert_eq!(
            resolve_batch_status(&counts(0, 0, 0, 4)),
            Some(BatchStatus::Failed)
        );
    }

    #[test]
    fn test_undispatchable_member_settles_batch_once_failed() {
        // a member rejected before dispatch (no recipient, bad amount) must
        // be marked failed: while it sits pending the batch can never leave
        // processing, since no webhook will ever arrive for it
        assert_eq!(
            resolve_batch_status(&counts(1, 0, 1, 0)),
            Some(BatchStatus::Processing)
        );
        // once marked failed the batch settles as partial
        assert_eq!(
            resolve_batch_status(&counts(0, 0, 1, 1)),
            Some(BatchStatus::Partial)
        );
    }

    #[test]
    fn test_terminal_status_always_recomputes_total() {
        use rust_decimal_macros::dec;

        // a member cancelled after attachment leaves the running total
        // stale, so every terminal transition recomputes from the members
        assert!(should_recompute_total(dec!(1500.00), BatchStatus::Completed));
        assert!(should_recompute_total(dec!(1500.00), BatchStatus::Partial));
        assert!(should_recompute_total(dec!(1500.00), BatchStatus::Failed));
        // zero totals are backfilled even mid-flight
        assert!(should_recompute_total(Decimal::ZERO, BatchStatus::Processing));
        // a non-terminal batch with a running total is left alone
        assert!(!should_recompute_total(dec!(1500.00), BatchStatus::Processing));
    }
}
