use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, PayoutError};

const TX_COLS: &str = "id, user_id, job_id, transaction_type, provider, transaction_id, \
     gross_amount, fee_amount, amount, status, rate_id, rate_percentage, \
     payment_period_id, batch_id, provider_reference, retry_count, extra_data, \
     created_at, updated_at";

const BATCH_COLS: &str = "id, reference, provider, period_id, user_id, total_amount, status, \
     provider_reference, note, created_at, updated_at";

/// Parameters for a new ledger entry
#[derive(Debug, Clone)]
pub struct NewWalletTransaction {
    pub user_id: Uuid,
    pub job_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub provider: Option<Provider>,
    pub gross_amount: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub rate_id: Option<Uuid>,
    pub rate_percentage: Option<Decimal>,
    pub payment_period_id: Option<Uuid>,
}

/// Parameters for a new audit log row
#[derive(Debug, Clone)]
pub struct NewPayoutLog {
    pub provider: Provider,
    pub endpoint: String,
    pub wallet_transaction_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub request_payload: serde_json::Value,
    pub response_payload: serde_json::Value,
    pub status_code: Option<i32>,
    pub idempotency_key: Option<String>,
    pub error: Option<String>,
}

/// Outcome of applying a provider-confirmed terminal status to an entry
#[derive(Debug)]
pub enum TransferOutcomeApply {
    /// Status transition was applied
    Applied(WalletTransaction),
    /// Entry already terminal - at-least-once delivery duplicate, no-op
    Duplicate(WalletTransaction),
    /// No entry matches the provider reference
    NotFound,
}

/// Per-batch member counts used by the batch finalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMemberCounts {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed_or_cancelled: i64,
}

/// Ledger repository - THE source of truth for all payout state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // ========== RATE OPERATIONS ==========

    /// The rate in effect right now - most recent by effective_from
    pub async fn current_rate(&self) -> AppResult<Option<Rate>> {
        let rate = sqlx::query_as::<_, Rate>(
            "SELECT id, percentage, effective_from FROM rates \
             WHERE effective_from <= now() \
             ORDER BY effective_from DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(rate)
    }

    // ========== PAYMENT PERIOD OPERATIONS ==========

    /// Weekly period (Monday -> Sunday) containing `date`, created lazily on
    /// first use. The unique (start_date, end_date) index makes concurrent
    /// creation safe.
    pub async fn get_or_create_weekly_period(&self, date: NaiveDate) -> AppResult<PaymentPeriod> {
        let (start, end) = PaymentPeriod::weekly_bounds(date);

        sqlx::query(
            "INSERT INTO payment_periods (name, start_date, end_date) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (start_date, end_date) DO NOTHING",
        )
        .bind(PaymentPeriod::weekly_name(start, end))
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;

        let period = sqlx::query_as::<_, PaymentPeriod>(
            "SELECT id, name, start_date, end_date FROM payment_periods \
             WHERE start_date = $1 AND end_date = $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(period)
    }

    pub async fn get_period(&self, period_id: Uuid) -> AppResult<Option<PaymentPeriod>> {
        let period = sqlx::query_as::<_, PaymentPeriod>(
            "SELECT id, name, start_date, end_date FROM payment_periods WHERE id = $1",
        )
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(period)
    }

    // ========== JOB / PROFILE LOOKUPS (collaborator data) ==========

    pub async fn get_job(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT id, status, price, assigned_at FROM jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn get_profile(&self, user_id: Uuid) -> AppResult<Option<PayoutProfile>> {
        let profile = sqlx::query_as::<_, PayoutProfile>(
            "SELECT user_id, username, first_name, last_name, email, phone, \
             mobile_money_provider, paystack_recipient \
             FROM payout_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    /// Persist a freshly provisioned recipient code on the user's profile
    pub async fn save_paystack_recipient(&self, user_id: Uuid, code: &str) -> AppResult<()> {
        sqlx::query("UPDATE payout_profiles SET paystack_recipient = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(code)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========== TRANSACTION OPERATIONS ==========

    /// Idempotency guard: does an active entry of this type already exist
    /// for (job, user)?
    pub async fn active_entry_exists(
        &self,
        job_id: Uuid,
        user_id: Uuid,
        transaction_type: TransactionType,
    ) -> AppResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS ( \
                SELECT 1 FROM wallet_transactions \
                WHERE job_id = $1 AND user_id = $2 AND transaction_type = $3 \
                  AND status IN ($4, $5))",
        )
        .bind(job_id)
        .bind(user_id)
        .bind(transaction_type)
        .bind(TransactionStatus::Pending)
        .bind(TransactionStatus::InProgress)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }

    pub async fn create_transaction(
        &self,
        new: NewWalletTransaction,
    ) -> AppResult<WalletTransaction> {
        let tx = sqlx::query_as::<_, WalletTransaction>(&format!(
            "INSERT INTO wallet_transactions \
             (user_id, job_id, transaction_type, provider, gross_amount, fee_amount, \
              amount, status, rate_id, rate_percentage, payment_period_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {TX_COLS}"
        ))
        .bind(new.user_id)
        .bind(new.job_id)
        .bind(new.transaction_type)
        .bind(new.provider)
        .bind(new.gross_amount)
        .bind(new.fee_amount)
        .bind(new.amount)
        .bind(new.status)
        .bind(new.rate_id)
        .bind(new.rate_percentage)
        .bind(new.payment_period_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(tx)
    }

    pub async fn get_transaction(&self, id: Uuid) -> AppResult<Option<WalletTransaction>> {
        let tx = sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {TX_COLS} FROM wallet_transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tx)
    }

    pub async fn transactions_in_batch(
        &self,
        batch_id: Uuid,
    ) -> AppResult<Vec<WalletTransaction>> {
        let txs = sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {TX_COLS} FROM wallet_transactions \
             WHERE batch_id = $1 ORDER BY created_at"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(txs)
    }

    /// Pending members of a batch, with their payout profiles joined in -
    /// the working set for a bulk gateway call
    pub async fn pending_batch_members(
        &self,
        batch_id: Uuid,
    ) -> AppResult<Vec<WalletTransaction>> {
        let txs = sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {TX_COLS} FROM wallet_transactions \
             WHERE batch_id = $1 AND status = $2 ORDER BY created_at"
        ))
        .bind(batch_id)
        .bind(TransactionStatus::Pending)
        .fetch_all(&self.pool)
        .await?;

        Ok(txs)
    }

    /// Cancel any active entries for (job, user) - explicit business action
    /// (freelancer unassignment). Cancelled entries are never picked up by
    /// discovery or dispatch again.
    pub async fn cancel_active_entries(&self, job_id: Uuid, user_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE wallet_transactions SET status = $3, updated_at = now() \
             WHERE job_id = $1 AND user_id = $2 AND status IN ($4, $5)",
        )
        .bind(job_id)
        .bind(user_id)
        .bind(TransactionStatus::Cancelled)
        .bind(TransactionStatus::Pending)
        .bind(TransactionStatus::InProgress)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========== BATCH OPERATIONS ==========

    pub async fn create_batch(
        &self,
        provider: Provider,
        period_id: Uuid,
        user_id: Option<Uuid>,
        status: BatchStatus,
        note: Option<&str>,
    ) -> AppResult<PaymentBatch> {
        let reference = Uuid::new_v4().simple().to_string();

        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "INSERT INTO payment_batches (reference, provider, period_id, user_id, status, note) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {BATCH_COLS}"
        ))
        .bind(&reference)
        .bind(provider)
        .bind(period_id)
        .bind(user_id)
        .bind(status)
        .bind(note)
        .fetch_one(&self.pool)
        .await?;

        info!(
            "Created batch {} provider={} period={} status={}",
            batch.reference,
            provider,
            period_id,
            status.as_str()
        );

        Ok(batch)
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> AppResult<Option<PaymentBatch>> {
        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {BATCH_COLS} FROM payment_batches WHERE id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(batch)
    }

    /// Most recent batch for (period, provider) - drives the late-batch rule
    pub async fn latest_batch_for_period(
        &self,
        period_id: Uuid,
        provider: Provider,
    ) -> AppResult<Option<PaymentBatch>> {
        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {BATCH_COLS} FROM payment_batches \
             WHERE period_id = $1 AND provider = $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(period_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(batch)
    }

    /// An existing batch for (period, provider) still open for attachment
    pub async fn open_batch_for_period(
        &self,
        period_id: Uuid,
        provider: Provider,
    ) -> AppResult<Option<PaymentBatch>> {
        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {BATCH_COLS} FROM payment_batches \
             WHERE period_id = $1 AND provider = $2 AND status IN ($3, $4) \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(period_id)
        .bind(provider)
        .bind(BatchStatus::Pending)
        .bind(BatchStatus::Late)
        .fetch_optional(&self.pool)
        .await?;

        Ok(batch)
    }

    /// Distinct periods that have eligible (pending, unbatched, completed-job)
    /// entries waiting for discovery
    pub async fn periods_with_eligible_entries(&self) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT wt.payment_period_id \
             FROM wallet_transactions wt \
             JOIN jobs j ON j.id = wt.job_id \
             WHERE wt.status = $1 AND wt.transaction_type = $2 \
               AND wt.batch_id IS NULL \
               AND wt.payment_period_id IS NOT NULL \
               AND j.status = 'completed'",
        )
        .bind(TransactionStatus::Pending)
        .bind(TransactionType::PaymentProcessing)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Attach all eligible entries for a period to a batch, under row locks,
    /// summing amounts into total_amount incrementally. Returns the number
    /// of entries attached.
    pub async fn attach_eligible_entries(
        &self,
        batch_id: Uuid,
        period_id: Uuid,
    ) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;

        // Lock the candidate rows so a concurrent discovery run cannot
        // attach them twice
        let candidates: Vec<(Uuid, Decimal)> = sqlx::query_as(
            "SELECT wt.id, wt.amount \
             FROM wallet_transactions wt \
             JOIN jobs j ON j.id = wt.job_id \
             WHERE wt.status = $1 AND wt.transaction_type = $3 \
               AND wt.batch_id IS NULL \
               AND wt.payment_period_id = $2 \
               AND j.status = 'completed' \
             FOR UPDATE OF wt",
        )
        .bind(TransactionStatus::Pending)
        .bind(period_id)
        .bind(TransactionType::PaymentProcessing)
        .fetch_all(&mut *tx)
        .await?;

        let mut attached = 0u64;
        let mut total = Decimal::ZERO;

        for (id, amount) in &candidates {
            sqlx::query("UPDATE wallet_transactions SET batch_id = $1, updated_at = now() WHERE id = $2")
                .bind(batch_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            total += *amount;
            attached += 1;
        }

        if attached > 0 {
            // Incremental add, never a full re-aggregation while entries are
            // still being attached
            sqlx::query(
                "UPDATE payment_batches \
                 SET total_amount = total_amount + $2, updated_at = now() WHERE id = $1",
            )
            .bind(batch_id)
            .bind(total)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(attached)
    }

    /// Delete a batch that ended up with no members (discovery created it
    /// speculatively). Transactions are never touched.
    pub async fn delete_empty_batch(&self, batch_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "DELETE FROM payment_batches b WHERE b.id = $1 \
             AND NOT EXISTS (SELECT 1 FROM wallet_transactions WHERE batch_id = b.id)",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== DISPATCH (row-locked helpers) ==========

    /// Pre-flight: lock the batch row and assert it is still dispatchable
    pub async fn lock_batch_for_dispatch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
    ) -> AppResult<PaymentBatch> {
        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {BATCH_COLS} FROM payment_batches WHERE id = $1 FOR UPDATE"
        ))
        .bind(batch_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(PayoutError::BatchNotFound(batch_id))?;

        if !batch.status.is_dispatchable() {
            return Err(PayoutError::BatchInvalidState {
                id: batch_id,
                current: batch.status,
                expected: BatchStatus::Pending,
            }
            .into());
        }

        Ok(batch)
    }

    pub async fn lock_pending_member_ids(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
    ) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM wallet_transactions \
             WHERE batch_id = $1 AND status = $2 FOR UPDATE",
        )
        .bind(batch_id)
        .bind(TransactionStatus::Pending)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn mark_batch_failed(&self, batch_id: Uuid, note: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE payment_batches SET status = $2, note = $3, updated_at = now() WHERE id = $1",
        )
        .bind(batch_id)
        .bind(BatchStatus::Failed)
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Permanent validation failure for one entry (no payout destination,
    /// unrepresentable amount): the provider never saw it. Guarded on
    /// pending so an entry raced by a webhook is never regressed.
    pub async fn mark_entry_failed(&self, id: Uuid, reason: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE wallet_transactions \
             SET status = $2, \
                 extra_data = extra_data || jsonb_build_object('failure_reason', $3::text), \
                 updated_at = now() \
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(TransactionStatus::Failed)
        .bind(reason)
        .bind(TransactionStatus::Pending)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The only place a whole batch leaves the pending state: record the
    /// provider batch reference, flip the batch to processing and the
    /// collected members to in_progress, all-or-nothing.
    pub async fn commit_batch_dispatch(
        &self,
        batch_id: Uuid,
        provider_reference: &str,
        member_ids: &[Uuid],
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE payment_batches \
             SET provider_reference = $2, status = $3, updated_at = now() WHERE id = $1",
        )
        .bind(batch_id)
        .bind(provider_reference)
        .bind(BatchStatus::Processing)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE wallet_transactions \
             SET status = $2, updated_at = now() \
             WHERE id = ANY($1) AND status = $3",
        )
        .bind(member_ids)
        .bind(TransactionStatus::InProgress)
        .bind(TransactionStatus::Pending)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    // ========== WEBHOOK / RECONCILE SUPPORT ==========

    /// Apply a provider-confirmed terminal status to the entry matching the
    /// given provider reference (transfer code). Row-locked and idempotent:
    /// entries already terminal are reported as duplicates, untouched.
    pub async fn apply_transfer_outcome(
        &self,
        provider_reference: &str,
        new_status: TransactionStatus,
        provider: Provider,
        audit_payload: serde_json::Value,
    ) -> AppResult<TransferOutcomeApply> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {TX_COLS} FROM wallet_transactions \
             WHERE provider_reference = $1 OR transaction_id = $1 \
             FOR UPDATE"
        ))
        .bind(provider_reference)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry) = existing else {
            return Ok(TransferOutcomeApply::NotFound);
        };

        if entry.status.is_terminal() {
            return Ok(TransferOutcomeApply::Duplicate(entry));
        }

        // A confirmed transfer promotes the entry to payment_received
        let updated = sqlx::query_as::<_, WalletTransaction>(&format!(
            "UPDATE wallet_transactions \
             SET status = $2, provider = $3, transaction_id = $4, \
                 transaction_type = CASE WHEN $2 = 'completed'::transaction_status \
                                    THEN 'payment_received'::transaction_type \
                                    ELSE transaction_type END, \
                 extra_data = extra_data || $5::jsonb, updated_at = now() \
             WHERE id = $1 \
             RETURNING {TX_COLS}"
        ))
        .bind(entry.id)
        .bind(new_status)
        .bind(provider)
        .bind(provider_reference)
        .bind(audit_payload)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TransferOutcomeApply::Applied(updated))
    }

    /// Reconciliation variant of `apply_transfer_outcome`: the entry is
    /// addressed by id because the provider reference was never recorded
    /// (the webhook was missed). Same row lock and terminal guard.
    pub async fn reconcile_entry(
        &self,
        id: Uuid,
        new_status: TransactionStatus,
        provider: Provider,
        provider_reference: Option<&str>,
        audit_payload: serde_json::Value,
    ) -> AppResult<TransferOutcomeApply> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {TX_COLS} FROM wallet_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry) = existing else {
            return Ok(TransferOutcomeApply::NotFound);
        };

        if entry.status.is_terminal() {
            return Ok(TransferOutcomeApply::Duplicate(entry));
        }

        let updated = sqlx::query_as::<_, WalletTransaction>(&format!(
            "UPDATE wallet_transactions \
             SET status = $2, provider = $3, \
                 transaction_id = COALESCE($4, transaction_id), \
                 provider_reference = COALESCE($4, provider_reference), \
                 transaction_type = CASE WHEN $2 = 'completed'::transaction_status \
                                    THEN 'payment_received'::transaction_type \
                                    ELSE transaction_type END, \
                 extra_data = extra_data || $5::jsonb, updated_at = now() \
             WHERE id = $1 \
             RETURNING {TX_COLS}"
        ))
        .bind(entry.id)
        .bind(new_status)
        .bind(provider)
        .bind(provider_reference)
        .bind(audit_payload)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TransferOutcomeApply::Applied(updated))
    }

    pub async fn lock_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
    ) -> AppResult<Option<PaymentBatch>> {
        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {BATCH_COLS} FROM payment_batches WHERE id = $1 FOR UPDATE"
        ))
        .bind(batch_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(batch)
    }

    pub async fn member_status_counts(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
    ) -> AppResult<BatchMemberCounts> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COUNT(*) FILTER (WHERE status = $2), \
                    COUNT(*) FILTER (WHERE status = $3), \
                    COUNT(*) FILTER (WHERE status = $4), \
                    COUNT(*) FILTER (WHERE status IN ($5, $6)) \
             FROM wallet_transactions WHERE batch_id = $1",
        )
        .bind(batch_id)
        .bind(TransactionStatus::Pending)
        .bind(TransactionStatus::InProgress)
        .bind(TransactionStatus::Completed)
        .bind(TransactionStatus::Failed)
        .bind(TransactionStatus::Cancelled)
        .fetch_one(&mut **tx)
        .await?;

        Ok(BatchMemberCounts {
            total: row.0,
            pending: row.1,
            in_progress: row.2,
            completed: row.3,
            failed_or_cancelled: row.4,
        })
    }

    /// Sum of member net amounts, excluding cancelled entries
    pub async fn member_amount_sum(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
    ) -> AppResult<Decimal> {
        let row: (Option<Decimal>,) = sqlx::query_as(
            "SELECT SUM(amount) FROM wallet_transactions \
             WHERE batch_id = $1 AND status <> $2",
        )
        .bind(batch_id)
        .bind(TransactionStatus::Cancelled)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.0.unwrap_or(Decimal::ZERO))
    }

    pub async fn update_batch_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
        status: BatchStatus,
        total_amount: Option<Decimal>,
    ) -> AppResult<()> {
        match total_amount {
            Some(total) => {
                sqlx::query(
                    "UPDATE payment_batches \
                     SET status = $2, total_amount = $3, updated_at = now() WHERE id = $1",
                )
                .bind(batch_id)
                .bind(status)
                .bind(total)
                .execute(&mut **tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE payment_batches SET status = $2, updated_at = now() WHERE id = $1",
                )
                .bind(batch_id)
                .bind(status)
                .execute(&mut **tx)
                .await?;
            }
        }

        Ok(())
    }

    // ========== RETRY SWEEP SUPPORT ==========

    /// Failed entries still below the retry ceiling
    pub async fn failed_retryable_ids(&self, max_retries: i32) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM wallet_transactions \
             WHERE status = $1 AND retry_count < $2 \
             ORDER BY updated_at",
        )
        .bind(TransactionStatus::Failed)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Record a retry attempt outcome. Increments the first-class retry
    /// counter; on success the entry is promoted to completed with the
    /// provider's reference.
    pub async fn record_retry_outcome(
        &self,
        id: Uuid,
        success: bool,
        provider_reference: Option<&str>,
    ) -> AppResult<WalletTransaction> {
        let status = if success {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };

        let tx = sqlx::query_as::<_, WalletTransaction>(&format!(
            "UPDATE wallet_transactions \
             SET retry_count = retry_count + 1, status = $2, \
                 provider_reference = COALESCE($3, provider_reference), \
                 transaction_type = CASE WHEN $2 = 'completed'::transaction_status \
                                    THEN 'payment_received'::transaction_type \
                                    ELSE transaction_type END, \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING {TX_COLS}"
        ))
        .bind(id)
        .bind(status)
        .bind(provider_reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(tx)
    }

    /// Single-dispatch pre-flight: lock one pending entry and claim it by
    /// flipping it to in_progress, so a concurrent dispatch of the same
    /// entry fails the pending assertion instead of reaching the provider.
    pub async fn claim_transaction_for_dispatch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> AppResult<WalletTransaction> {
        let entry = sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {TX_COLS} FROM wallet_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(PayoutError::TransactionNotFound(id))?;

        if entry.status != TransactionStatus::Pending {
            return Err(PayoutError::TransactionInvalidState {
                id,
                current: entry.status,
                expected: TransactionStatus::Pending,
            }
            .into());
        }

        let claimed = sqlx::query_as::<_, WalletTransaction>(&format!(
            "UPDATE wallet_transactions SET status = $2, updated_at = now() \
             WHERE id = $1 RETURNING {TX_COLS}"
        ))
        .bind(id)
        .bind(TransactionStatus::InProgress)
        .fetch_one(&mut **tx)
        .await?;

        Ok(claimed)
    }

    /// Terminal outcome of a single (non-batch) dispatch
    pub async fn record_single_dispatch_outcome(
        &self,
        id: Uuid,
        success: bool,
        provider_reference: Option<&str>,
        provider: Provider,
    ) -> AppResult<WalletTransaction> {
        let status = if success {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };

        let tx = sqlx::query_as::<_, WalletTransaction>(&format!(
            "UPDATE wallet_transactions \
             SET status = $2, provider = $3, \
                 provider_reference = COALESCE($4, provider_reference), \
                 transaction_type = CASE WHEN $2 = 'completed'::transaction_status \
                                    THEN 'payment_received'::transaction_type \
                                    ELSE transaction_type END, \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING {TX_COLS}"
        ))
        .bind(id)
        .bind(status)
        .bind(provider)
        .bind(provider_reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(tx)
    }

    // ========== AUDIT LOG ==========

    /// Insert an immutable audit row. Always writes through the pool, never
    /// through an open transaction: the log must survive a caller rollback.
    pub async fn insert_log(&self, new: NewPayoutLog) -> AppResult<PayoutLog> {
        let log = sqlx::query_as::<_, PayoutLog>(
            "INSERT INTO payout_logs \
             (provider, endpoint, wallet_transaction_id, batch_id, request_payload, \
              response_payload, status_code, idempotency_key, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING id, provider, endpoint, wallet_transaction_id, batch_id, \
                       request_payload, response_payload, status_code, idempotency_key, \
                       error, created_at",
        )
        .bind(new.provider)
        .bind(&new.endpoint)
        .bind(new.wallet_transaction_id)
        .bind(new.batch_id)
        .bind(&new.request_payload)
        .bind(&new.response_payload)
        .bind(new.status_code)
        .bind(&new.idempotency_key)
        .bind(&new.error)
        .fetch_one(&self.pool)
        .await?;

        Ok(log)
    }
}
