use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Payout provider enum - the closed set of supported gateways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "provider_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Paystack,
    Paypal,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Paystack => "paystack",
            Provider::Paypal => "paypal",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s.to_ascii_lowercase().as_str() {
            "paystack" => Some(Provider::Paystack),
            "paypal" => Some(Provider::Paypal),
            _ => None,
        }
    }
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    JobPicked,
    PaymentProcessing,
    PaymentReceived,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::JobPicked => "job_picked",
            TransactionType::PaymentProcessing => "payment_processing",
            TransactionType::PaymentReceived => "payment_received",
        }
    }
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::InProgress => "in_progress",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// Active entries block duplicate payout intents for the same (job, user)
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionStatus::Pending | TransactionStatus::InProgress)
    }

    /// Terminal statuses never transition automatically again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }
}

/// Batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "batch_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Partial,
    Failed,
    Late,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
            BatchStatus::Late => "late",
        }
    }

    /// A `late` batch is an open batch for an already-settled period; it is
    /// dispatchable exactly like a fresh `pending` batch.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Late)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed
        )
    }
}

/// Versioned platform-fee percentage. Immutable once created; the current
/// rate is the most recent row by effective_from.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Rate {
    pub id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub percentage: Decimal,
    pub effective_from: DateTime<Utc>,
}

impl Rate {
    /// Platform fee on a gross amount, rounded half-up to 2 dp
    pub fn fee_on(&self, gross: Decimal) -> Decimal {
        (gross * self.percentage / Decimal::from(100))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }
}

/// Per-freelancer net split, rounded half-up to 2 dp
pub fn split_net(net: Decimal, freelancer_count: u32) -> Decimal {
    if freelancer_count == 0 {
        return Decimal::ZERO;
    }
    (net / Decimal::from(freelancer_count))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// A non-overlapping window of time every ledger entry and batch anchors to
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentPeriod {
    pub id: Uuid,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl PaymentPeriod {
    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }

    /// Weekly period bounds (Monday -> Sunday) containing `date`
    pub fn weekly_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = date - Duration::days(date.weekday().num_days_from_monday() as i64);
        (start, start + Duration::days(6))
    }

    pub fn weekly_name(start: NaiveDate, end: NaiveDate) -> String {
        format!("Week {} ({} → {})", start.iso_week().week(), start, end)
    }
}

/// Read-only view of a marketplace job. The job domain owns this table;
/// the payout engine only consumes it as lookup data.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub status: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// Read-only payout metadata from the profile domain. The single writable
/// column is the cached provider recipient code, persisted after lazy
/// provisioning so subsequent payouts reuse it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PayoutProfile {
    pub user_id: Uuid,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub mobile_money_provider: Option<String>,
    pub paystack_recipient: Option<String>,
}

impl PayoutProfile {
    pub fn display_name(&self) -> String {
        let full = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

/// Ledger entry - one row per (user, job, type) representing money owed or
/// moved. THE source of truth for payout state; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub job_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub provider: Option<Provider>,
    /// Idempotent unique external transaction id (provider transfer code)
    pub transaction_id: Option<String>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub gross_amount: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub fee_amount: Option<Decimal>,
    /// Net amount payable to the user
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub rate_id: Option<Uuid>,
    /// Rate frozen by value at creation time; never recomputed retroactively
    #[serde(with = "rust_decimal::serde::float_option")]
    pub rate_percentage: Option<Decimal>,
    pub payment_period_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub provider_reference: Option<String>,
    pub retry_count: i32,
    /// Opaque audit payload; business logic never reads individual fields
    pub extra_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provider- and period-scoped grouping of ledger entries dispatched
/// together in one external payout call. Aggregates references only;
/// deleting a batch never deletes its transactions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentBatch {
    pub id: Uuid,
    /// Unique provider-facing reference
    pub reference: String,
    pub provider: Provider,
    pub period_id: Uuid,
    /// Batch initiator (system or admin account)
    pub user_id: Option<Uuid>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
    pub status: BatchStatus,
    /// External batch id returned by the provider
    pub provider_reference: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentBatch {
    /// A settled batch has been through the provider and may never be
    /// reused; newly-eligible entries for its period go into a late batch.
    pub fn is_settled(&self) -> bool {
        self.provider_reference.is_some()
            && matches!(self.status, BatchStatus::Completed | BatchStatus::Partial)
    }
}

/// Immutable audit row for every outbound/inbound gateway interaction.
/// Forensic trail only - never read for business-logic decisions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PayoutLog {
    pub id: Uuid,
    pub provider: Provider,
    pub endpoint: String,
    pub wallet_transaction_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub request_payload: serde_json::Value,
    pub response_payload: serde_json::Value,
    pub status_code: Option<i32>,
    pub idempotency_key: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rate(pct: Decimal) -> Rate {
        Rate {
            id: Uuid::new_v4(),
            percentage: pct,
            effective_from: Utc::now(),
        }
    }

    #[test]
    fn test_fee_math_invariant() {
        let gross = dec!(1000.00);
        for pct in 0..=100 {
            let r = rate(Decimal::from(pct));
            let fee = r.fee_on(gross);
            let net = gross - fee;
            assert_eq!(fee, dec!(10.00) * Decimal::from(pct));
            assert_eq!(net + fee, gross);
            assert!(fee >= Decimal::ZERO && fee <= gross);
        }
    }

    #[test]
    fn test_fee_rounding_half_up() {
        // 10% of 100.05 = 10.005 -> 10.01
        let r = rate(dec!(10));
        assert_eq!(r.fee_on(dec!(100.05)), dec!(10.01));
        // 3% of 33.33 = 0.9999 -> 1.00
        let r = rate(dec!(3));
        assert_eq!(r.fee_on(dec!(33.33)), dec!(1.00));
    }

    #[test]
    fn test_happy_path_amounts() {
        // Job price 1000, rate 10%: gross=1000, fee=100, net=900
        let r = rate(dec!(10.00));
        let gross = dec!(1000);
        let fee = r.fee_on(gross);
        assert_eq!(fee, dec!(100.00));
        assert_eq!(gross - fee, dec!(900.00));
        assert_eq!(split_net(gross - fee, 1), dec!(900.00));
    }

    #[test]
    fn test_split_net_across_freelancers() {
        assert_eq!(split_net(dec!(900), 3), dec!(300.00));
        assert_eq!(split_net(dec!(100), 3), dec!(33.33));
        assert_eq!(split_net(dec!(100), 0), Decimal::ZERO);
    }

    #[test]
    fn test_period_covers() {
        let period = PaymentPeriod {
            id: Uuid::new_v4(),
            name: "test".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 9).unwrap(),
        };
        assert!(period.covers(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()));
        assert!(period.covers(NaiveDate::from_ymd_opt(2024, 6, 9).unwrap()));
        assert!(!period.covers(NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()));
        assert!(!period.covers(NaiveDate::from_ymd_opt(2024, 6, 2).unwrap()));
    }

    #[test]
    fn test_weekly_bounds_monday_to_sunday() {
        // 2024-06-05 is a Wednesday
        let date = NaiveDate::from_ymd_opt(2024, 6, 5).unwrap();
        let (start, end) = PaymentPeriod::weekly_bounds(date);
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 6, 9).unwrap());

        // A Monday maps onto itself
        let (start, end) = PaymentPeriod::weekly_bounds(start);
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 6, 9).unwrap());

        // Adjacent weeks never overlap
        let (next_start, _) = PaymentPeriod::weekly_bounds(end + Duration::days(1));
        assert_eq!(next_start, end + Duration::days(1));
    }

    #[test]
    fn test_batch_settled_requires_reference_and_terminal_status() {
        let mut batch = PaymentBatch {
            id: Uuid::new_v4(),
            reference: "ref".into(),
            provider: Provider::Paystack,
            period_id: Uuid::new_v4(),
            user_id: None,
            total_amount: Decimal::ZERO,
            status: BatchStatus::Completed,
            provider_reference: None,
            note: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        // completed without a provider reference is not settled
        assert!(!batch.is_settled());

        batch.provider_reference = Some("BULK_abc".into());
        assert!(batch.is_settled());

        batch.status = BatchStatus::Processing;
        assert!(!batch.is_settled());
    }

    #[test]
    fn test_status_predicates() {
        assert!(TransactionStatus::Pending.is_active());
        assert!(TransactionStatus::InProgress.is_active());
        assert!(!TransactionStatus::Cancelled.is_active());
        assert!(TransactionStatus::Cancelled.is_terminal());
        assert!(BatchStatus::Late.is_dispatchable());
        assert!(BatchStatus::Pending.is_dispatchable());
        assert!(!BatchStatus::Processing.is_dispatchable());
    }
}
