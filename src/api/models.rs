use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::models::{PaymentBatch, Provider, WalletTransaction};

/// Inbound job-domain event: a job finished and its freelancers are owed
#[derive(Debug, Deserialize)]
pub struct JobCompletedEvent {
    pub job_id: Uuid,
    pub freelancer_ids: Vec<Uuid>,
}

/// Inbound assignment event; `assigned: false` means the freelancer was
/// removed from the job and their active entries must be cancelled
#[derive(Debug, Deserialize)]
pub struct JobAssignedEvent {
    pub job_id: Uuid,
    pub user_id: Uuid,
    #[serde(default = "default_assigned")]
    pub assigned: bool,
}

fn default_assigned() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct JobEventResponse {
    pub job_id: Uuid,
    pub created: u32,
    pub cancelled: u64,
}

/// Admin request: create a batch for an explicit provider and period. The
/// period may be given by id or by any date inside the target week.
#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub provider: Provider,
    pub period_id: Option<Uuid>,
    pub period_date: Option<NaiveDate>,
    pub initiated_by: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverBatchesRequest {
    pub provider: Option<Provider>,
    pub initiated_by: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PaySingleRequest {
    pub provider: Provider,
}

/// Batch detail plus a summary of its members
#[derive(Debug, Serialize)]
pub struct BatchDetailResponse {
    #[serde(flatten)]
    pub batch: PaymentBatch,
    pub member_count: usize,
    pub members: Vec<WalletTransaction>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub providers: Vec<Provider>,
}

/// Webhook acknowledgement. Providers retry on non-2xx, so anything already
/// settled or not addressed to us still acks with 200.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: String,
}

impl WebhookAck {
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }

    pub fn duplicate() -> Self {
        Self {
            status: "duplicate".into(),
        }
    }

    pub fn ignored() -> Self {
        Self {
            status: "ignored".into(),
        }
    }
}
