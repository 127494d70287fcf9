use async_trait::async_trait;
use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::{PaymentBatch, Provider, WalletTransaction};

/// Result of a single-transfer call.
///
/// Business failures (missing destination, provider rejection) come back as
/// `success = false` with an error string, not as an `Err`: one failing
/// entry must never abort unrelated accounting. `Err` is reserved for
/// programming errors.
#[derive(Debug, Clone)]
pub struct PayoutOutcome {
    pub success: bool,
    pub provider_ref: Option<String>,
    /// Provider response stored verbatim - opaque beyond the named fields
    pub raw: serde_json::Value,
    pub error: Option<String>,
}

impl PayoutOutcome {
    pub fn failure(raw: serde_json::Value, error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_ref: None,
            raw,
            error: Some(error.into()),
        }
    }
}

/// Result of a bulk-transfer call covering many ledger entries
#[derive(Debug, Clone)]
pub struct BulkPayoutOutcome {
    pub success: bool,
    /// External batch id assigned by the provider
    pub provider_batch_ref: Option<String>,
    pub raw: serde_json::Value,
    pub error: Option<String>,
    /// Entries skipped for lack of a resolvable payout destination; the
    /// rest of the batch still goes through
    pub skipped: Vec<(Uuid, String)>,
}

/// Uniform payout capability contract, one implementation per provider.
///
/// Recipient provisioning is an internal concern: implementations that need
/// a registered destination resolve or lazily create it inside `payout` /
/// `bulk_payout_batch`, persist it on the user's profile and reuse it.
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    fn provider(&self) -> Provider;

    /// Execute a single transfer for one ledger entry. Writes exactly one
    /// audit log row whether the call succeeds or fails.
    async fn payout(
        &self,
        entry: &WalletTransaction,
        idempotency_key: Option<String>,
    ) -> AppResult<PayoutOutcome>;

    /// One external call covering the batch's pending entries. Entries
    /// without a resolvable destination are skipped and reported without
    /// aborting the call for the valid remainder.
    async fn bulk_payout_batch(
        &self,
        batch: &PaymentBatch,
        entries: &[WalletTransaction],
    ) -> AppResult<BulkPayoutOutcome>;

    /// Authenticate an inbound provider callback over the exact raw bytes
    async fn verify_webhook(&self, headers: &HeaderMap, raw_body: &[u8]) -> bool;

    /// Poll the provider's bulk-transfer state by its external reference.
    /// Used by the reconciliation sweep for providers whose webhooks may be
    /// missed. Response is provider-owned and opaque.
    async fn fetch_bulk_status(&self, provider_reference: &str) -> AppResult<serde_json::Value>;
}
