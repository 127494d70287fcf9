use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult, PayoutError},
    gateways::registry::GatewayRegistry,
    ledger::{
        models::{Provider, WalletTransaction},
        repository::LedgerRepository,
    },
    payouts::{
        discovery::{BatchDiscoveryService, DiscoveredBatch},
        executor::{BatchExecutor, DispatchSummary},
        finalizer::BatchFinalizer,
        intent::PayoutIntentService,
        retry::{ReconcileSummary, RetryService, SweepSummary},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerRepository>,
    pub registry: Arc<GatewayRegistry>,
    pub intents: Arc<PayoutIntentService>,
    pub discovery: Arc<BatchDiscoveryService>,
    pub executor: Arc<BatchExecutor>,
    pub retry: Arc<RetryService>,
    pub finalizer: Arc<BatchFinalizer>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        providers: state.registry.registered_providers(),
    })
}

/// Create payout intents for a completed job
/// POST /api/v1/events/job-completed
pub async fn job_completed(
    State(state): State<AppState>,
    Json(event): Json<JobCompletedEvent>,
) -> AppResult<Json<JobEventResponse>> {
    info!(
        "Job completed event | job={} freelancers={}",
        event.job_id,
        event.freelancer_ids.len()
    );

    let created = state
        .intents
        .create_for_completed_job(event.job_id, &event.freelancer_ids)
        .await?;

    Ok(Json(JobEventResponse {
        job_id: event.job_id,
        created,
        cancelled: 0,
    }))
}

/// Record an assignment, or cancel the freelancer's active entries on
/// unassignment
/// POST /api/v1/events/job-assigned
pub async fn job_assigned(
    State(state): State<AppState>,
    Json(event): Json<JobAssignedEvent>,
) -> AppResult<Json<JobEventResponse>> {
    if event.assigned {
        let created = state
            .intents
            .record_job_assignment(event.job_id, event.user_id)
            .await?;

        Ok(Json(JobEventResponse {
            job_id: event.job_id,
            created: created as u32,
            cancelled: 0,
        }))
    } else {
        let cancelled = state
            .intents
            .cancel_for_unassignment(event.job_id, event.user_id)
            .await?;

        Ok(Json(JobEventResponse {
            job_id: event.job_id,
            created: 0,
            cancelled,
        }))
    }
}

/// Run batch discovery immediately
/// POST /api/v1/admin/batches/discover
pub async fn discover_batches(
    State(state): State<AppState>,
    Json(request): Json<DiscoverBatchesRequest>,
) -> AppResult<Json<Vec<DiscoveredBatch>>> {
    let provider = request.provider.unwrap_or(Provider::Paystack);
    let discovered = state
        .discovery
        .auto_discover(provider, request.initiated_by)
        .await?;

    Ok(Json(discovered))
}

/// Create a batch for an explicit provider and period
/// POST /api/v1/admin/batches/create
pub async fn create_batch(
    State(state): State<AppState>,
    Json(request): Json<CreateBatchRequest>,
) -> AppResult<Json<DiscoveredBatch>> {
    let period_id = match (request.period_id, request.period_date) {
        (Some(id), _) => id,
        (None, Some(date)) => state.ledger.get_or_create_weekly_period(date).await?.id,
        (None, None) => {
            return Err(AppError::InvalidInput(
                "period_id or period_date is required".into(),
            ))
        }
    };

    let created = state
        .discovery
        .create_batch_for_period(request.provider, period_id, request.initiated_by)
        .await?;

    Ok(Json(created))
}

/// Dispatch a batch through its provider, synchronously
/// POST /api/v1/admin/batches/:id/dispatch
pub async fn dispatch_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> AppResult<Json<DispatchSummary>> {
    let summary = state.executor.dispatch_batch(batch_id).await?;
    Ok(Json(summary))
}

/// Fire-and-forget dispatch; the response only confirms the batch exists
/// and is dispatchable at this moment
/// POST /api/v1/admin/batches/:id/dispatch-async
pub async fn dispatch_batch_async(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let batch = state
        .ledger
        .get_batch(batch_id)
        .await?
        .ok_or(PayoutError::BatchNotFound(batch_id))?;

    if !batch.status.is_dispatchable() {
        return Err(PayoutError::BatchInvalidState {
            id: batch_id,
            current: batch.status,
            expected: crate::ledger::models::BatchStatus::Pending,
        }
        .into());
    }

    state.executor.dispatch_batch_async(batch_id);

    Ok(Json(serde_json::json!({
        "batch_id": batch_id,
        "reference": batch.reference,
        "accepted": true,
    })))
}

/// Poll the provider for the batch's transfer states and apply missed
/// outcomes
/// POST /api/v1/admin/batches/:id/reconcile
pub async fn reconcile_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> AppResult<Json<ReconcileSummary>> {
    let summary = state.retry.reconcile_batch(batch_id).await?;
    Ok(Json(summary))
}

/// Pay a single pending entry immediately, outside any batch
/// POST /api/v1/admin/transactions/:id/pay
pub async fn pay_single(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(request): Json<PaySingleRequest>,
) -> AppResult<Json<WalletTransaction>> {
    let updated = state
        .executor
        .dispatch_single(transaction_id, request.provider)
        .await?;

    Ok(Json(updated))
}

/// Run the retry sweep immediately
/// POST /api/v1/admin/retry-sweep
pub async fn run_retry_sweep(
    State(state): State<AppState>,
) -> AppResult<Json<SweepSummary>> {
    let summary = state.retry.sweep().await?;
    Ok(Json(summary))
}

/// GET /api/v1/batches/:id
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> AppResult<Json<BatchDetailResponse>> {
    let batch = state
        .ledger
        .get_batch(batch_id)
        .await?
        .ok_or(PayoutError::BatchNotFound(batch_id))?;

    let members = state.ledger.transactions_in_batch(batch_id).await?;

    Ok(Json(BatchDetailResponse {
        member_count: members.len(),
        batch,
        members,
    }))
}

/// GET /api/v1/transactions/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> AppResult<Json<WalletTransaction>> {
    let tx = state
        .ledger
        .get_transaction(transaction_id)
        .await?
        .ok_or(PayoutError::TransactionNotFound(transaction_id))?;

    Ok(Json(tx))
}
