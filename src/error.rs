use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::{BatchStatus, Provider, TransactionStatus};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payout error: {0}")]
    Payout(#[from] PayoutError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Payout orchestration errors.
///
/// The state variants (`BatchInvalidState`, `TransactionInvalidState`) are
/// programming or race conditions: they propagate to the caller as hard
/// failures and must never be retried or silently swallowed.
#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("Batch {id} in invalid state: {current:?}, expected: {expected:?}")]
    BatchInvalidState {
        id: Uuid,
        current: BatchStatus,
        expected: BatchStatus,
    },

    #[error("Transaction {id} in invalid state: {current:?}, expected: {expected:?}")]
    TransactionInvalidState {
        id: Uuid,
        current: TransactionStatus,
        expected: TransactionStatus,
    },

    #[error("No pending transactions in batch {0}")]
    EmptyBatch(Uuid),

    #[error("No eligible transactions for period {0}")]
    NoEligibleTransactions(Uuid),

    #[error("No platform rate configured")]
    NoRateConfigured,
}

/// Errors raised by the payment gateway layer.
///
/// `Permanent` failures (missing destination, malformed amount) are never
/// retried. `Transient` failures have already exhausted the gateway's own
/// backoff and are eligible for the retry sweep.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unknown payout provider: {0}")]
    UnknownProvider(String),

    #[error("No payout destination for user {user_id}: {reason}")]
    NoDestination { user_id: Uuid, reason: String },

    #[error("Permanent gateway failure ({provider:?}): {message}")]
    Permanent { provider: Provider, message: String },

    #[error("Transient gateway failure ({provider:?}) after {attempts} attempts: {message}")]
    Transient {
        provider: Provider,
        attempts: u32,
        message: String,
    },

    #[error("Provider response missing field: {0}")]
    MalformedResponse(String),
}

/// Inbound webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("No transaction matches provider reference {0}")]
    UnknownReference(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Payout(PayoutError::BatchNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "BATCH_NOT_FOUND",
                format!("Batch not found: {}", id),
                None,
            ),
            AppError::Payout(PayoutError::TransactionNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "TRANSACTION_NOT_FOUND",
                format!("Transaction not found: {}", id),
                None,
            ),
            AppError::Payout(PayoutError::BatchInvalidState { id, current, expected }) => (
                StatusCode::CONFLICT,
                "BATCH_INVALID_STATE",
                format!("Batch {} already processed", id),
                Some(serde_json::json!({
                    "current": current.as_str(),
                    "expected": expected.as_str(),
                })),
            ),
            AppError::Payout(PayoutError::TransactionInvalidState { id, current, expected }) => (
                StatusCode::CONFLICT,
                "TRANSACTION_INVALID_STATE",
                format!("Transaction {} not dispatchable", id),
                Some(serde_json::json!({
                    "current": current.as_str(),
                    "expected": expected.as_str(),
                })),
            ),
            AppError::Payout(PayoutError::EmptyBatch(id)) => (
                StatusCode::CONFLICT,
                "EMPTY_BATCH",
                format!("No pending transactions in batch {}", id),
                None,
            ),
            AppError::Payout(PayoutError::NoEligibleTransactions(period)) => (
                StatusCode::CONFLICT,
                "NO_ELIGIBLE_TRANSACTIONS",
                format!("No eligible transactions for period {}", period),
                None,
            ),
            AppError::Webhook(WebhookError::InvalidSignature) => (
                StatusCode::BAD_REQUEST,
                "INVALID_SIGNATURE",
                "Webhook signature verification failed".to_string(),
                None,
            ),
            AppError::Webhook(WebhookError::InvalidPayload(msg)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_PAYLOAD",
                format!("Invalid webhook payload: {}", msg),
                None,
            ),
            AppError::Gateway(GatewayError::NoDestination { user_id, reason }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "NO_PAYOUT_DESTINATION",
                format!("No payout destination for user {}", user_id),
                Some(serde_json::json!({ "reason": reason })),
            ),
            AppError::Gateway(GatewayError::UnknownProvider(p)) => (
                StatusCode::BAD_REQUEST,
                "UNKNOWN_PROVIDER",
                format!("Unknown payout provider: {}", p),
                None,
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            AppError::InvalidInput(msg) | AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None)
            }
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Internal(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
