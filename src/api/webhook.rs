use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::handler::AppState;
use super::models::WebhookAck;
use crate::{
    error::{AppResult, WebhookError},
    ledger::models::{Provider, TransactionStatus},
    ledger::repository::{NewPayoutLog, TransferOutcomeApply},
};

/// Ledger entry id embedded in a dispatch-time transfer reference
/// ("{batch_reference}:{transaction_id}")
pub fn parse_entry_reference(reference: &str) -> Option<Uuid> {
    reference.rsplit(':').next()?.parse().ok()
}

/// Terminal status implied by a Paystack transfer event. None means the
/// event is not a transfer outcome and is acked untouched.
pub fn paystack_event_status(event: &str) -> Option<TransactionStatus> {
    match event {
        "transfer.success" => Some(TransactionStatus::Completed),
        "transfer.failed" | "transfer.reversed" => Some(TransactionStatus::Failed),
        _ => None,
    }
}

/// Terminal status implied by a PayPal payouts-item event
pub fn paypal_event_status(event_type: &str) -> Option<TransactionStatus> {
    match event_type {
        "PAYMENT.PAYOUTS-ITEM.SUCCEEDED" => Some(TransactionStatus::Completed),
        "PAYMENT.PAYOUTS-ITEM.FAILED"
        | "PAYMENT.PAYOUTS-ITEM.DENIED"
        | "PAYMENT.PAYOUTS-ITEM.BLOCKED"
        | "PAYMENT.PAYOUTS-ITEM.RETURNED"
        | "PAYMENT.PAYOUTS-ITEM.CANCELED" => Some(TransactionStatus::Failed),
        _ => None,
    }
}

/// Paystack transfer webhook. Signature is verified over the exact raw
/// bytes before any parsing; bad signatures are rejected with 400 while
/// duplicates and unknown references ack with 200 so the provider stops
/// retrying.
/// POST /api/v1/webhook/paystack
pub async fn paystack_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let gateway = state.registry.get(Provider::Paystack)?;

    if !gateway.verify_webhook(&headers, &body).await {
        warn!("Rejected Paystack webhook: bad signature");
        return Err(WebhookError::InvalidSignature.into());
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

    let event = payload["event"].as_str().unwrap_or("");
    let Some(new_status) = paystack_event_status(event) else {
        return ack_ignored(&state, Provider::Paystack, event, &payload).await;
    };

    let data = &payload["data"];
    let reference = data["reference"].as_str().unwrap_or("");
    let transfer_code = data["transfer_code"].as_str();

    let applied = apply_outcome(
        &state,
        Provider::Paystack,
        new_status,
        reference,
        transfer_code,
        data.clone(),
    )
    .await?;

    ack_applied(&state, Provider::Paystack, event, &payload, applied).await
}

/// PayPal payouts webhook, verified through the provider's
/// verify-webhook-signature endpoint.
/// POST /api/v1/webhook/paypal
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let gateway = state.registry.get(Provider::Paypal)?;

    if !gateway.verify_webhook(&headers, &body).await {
        warn!("Rejected PayPal webhook: verification failed");
        return Err(WebhookError::InvalidSignature.into());
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

    let event_type = payload["event_type"].as_str().unwrap_or("");
    let Some(new_status) = paypal_event_status(event_type) else {
        return ack_ignored(&state, Provider::Paypal, event_type, &payload).await;
    };

    let resource = &payload["resource"];
    let sender_item_id = resource["payout_item"]["sender_item_id"]
        .as_str()
        .unwrap_or("");
    let provider_ref = resource["transaction_id"]
        .as_str()
        .or(resource["payout_item_id"].as_str());

    let applied = apply_outcome(
        &state,
        Provider::Paypal,
        new_status,
        sender_item_id,
        provider_ref,
        resource.clone(),
    )
    .await?;

    ack_applied(&state, Provider::Paypal, event_type, &payload, applied).await
}

/// Route the confirmed outcome onto the right ledger entry. Entries
/// dispatched in bulk are addressed by the id inside our own transfer
/// reference; retried or singly dispatched entries already carry the
/// provider's code and are matched by it.
async fn apply_outcome(
    state: &AppState,
    provider: Provider,
    new_status: TransactionStatus,
    reference: &str,
    provider_code: Option<&str>,
    audit_payload: serde_json::Value,
) -> AppResult<TransferOutcomeApply> {
    if let Some(code) = provider_code {
        let applied = state
            .ledger
            .apply_transfer_outcome(code, new_status, provider, audit_payload.clone())
            .await?;

        if !matches!(applied, TransferOutcomeApply::NotFound) {
            return Ok(applied);
        }
    }

    if let Some(id) = parse_entry_reference(reference) {
        return state
            .ledger
            .reconcile_entry(id, new_status, provider, provider_code, audit_payload)
            .await;
    }

    Ok(TransferOutcomeApply::NotFound)
}

/// Endpoint label for an inbound event's audit row
fn webhook_endpoint_label(event: &str) -> String {
    if event.is_empty() {
        "webhook:unknown".to_string()
    } else {
        format!("webhook:{}", event)
    }
}

/// Every verified inbound event leaves an audit row, including events with
/// no transfer outcome to apply.
async fn ack_ignored(
    state: &AppState,
    provider: Provider,
    event: &str,
    payload: &serde_json::Value,
) -> AppResult<Json<WebhookAck>> {
    info!("Ignoring {} event {}", provider, event);

    let ack = WebhookAck::ignored();
    state
        .ledger
        .insert_log(NewPayoutLog {
            provider,
            endpoint: webhook_endpoint_label(event),
            wallet_transaction_id: None,
            batch_id: None,
            request_payload: payload.clone(),
            response_payload: serde_json::json!({ "ack": ack.status }),
            status_code: Some(200),
            idempotency_key: None,
            error: None,
        })
        .await?;

    Ok(Json(ack))
}

async fn ack_applied(
    state: &AppState,
    provider: Provider,
    event: &str,
    payload: &serde_json::Value,
    applied: TransferOutcomeApply,
) -> AppResult<Json<WebhookAck>> {
    let (entry, ack, error) = match applied {
        TransferOutcomeApply::Applied(entry) => (Some(entry), WebhookAck::ok(), None),
        TransferOutcomeApply::Duplicate(entry) => {
            info!("Duplicate {} webhook for entry {}", provider, entry.id);
            (Some(entry), WebhookAck::duplicate(), None)
        }
        TransferOutcomeApply::NotFound => {
            warn!("{} webhook {} matched no ledger entry", provider, event);
            (None, WebhookAck::ignored(), Some("no_matching_entry".to_string()))
        }
    };

    state
        .ledger
        .insert_log(NewPayoutLog {
            provider,
            endpoint: webhook_endpoint_label(event),
            wallet_transaction_id: entry.as_ref().map(|e| e.id),
            batch_id: entry.as_ref().and_then(|e| e.batch_id),
            request_payload: payload.clone(),
            response_payload: serde_json::json!({ "ack": ack.status }),
            status_code: Some(200),
            idempotency_key: None,
            error,
        })
        .await?;

    // a settled member may tip its batch into a terminal status
    if let Some(batch_id) = entry.and_then(|e| e.batch_id) {
        state.finalizer.finalize(batch_id).await?;
    }

    Ok(Json(ack))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry_reference() {
        let id = Uuid::new_v4();
        assert_eq!(parse_entry_reference(&format!("batchref:{}", id)), Some(id));
        // a bare uuid also parses (single-dispatch references)
        assert_eq!(parse_entry_reference(&id.to_string()), Some(id));
        assert_eq!(parse_entry_reference("batchref:not-a-uuid"), None);
        assert_eq!(parse_entry_reference(""), None);
    }

    #[test]
    fn test_paystack_event_mapping() {
        assert_eq!(
            paystack_event_status("transfer.success"),
            Some(TransactionStatus::Completed)
        );
        assert_eq!(
            paystack_event_status("transfer.failed"),
            Some(TransactionStatus::Failed)
        );
        assert_eq!(
            paystack_event_status("transfer.reversed"),
            Some(TransactionStatus::Failed)
        );
        assert_eq!(paystack_event_status("charge.success"), None);
        assert_eq!(paystack_event_status(""), None);
    }

    #[test]
    fn test_webhook_endpoint_label() {
        // non-transfer events also get an audit row; the label must never
        // be empty even when the payload omits the event name
        assert_eq!(
            webhook_endpoint_label("charge.success"),
            "webhook:charge.success"
        );
        assert_eq!(webhook_endpoint_label(""), "webhook:unknown");
    }

    #[test]
    fn test_paypal_event_mapping() {
        assert_eq!(
            paypal_event_status("PAYMENT.PAYOUTS-ITEM.SUCCEEDED"),
            Some(TransactionStatus::Completed)
        );
        assert_eq!(
            paypal_event_status("PAYMENT.PAYOUTS-ITEM.DENIED"),
            Some(TransactionStatus::Failed)
        );
        assert_eq!(paypal_event_status("PAYMENT.PAYOUTSBATCH.SUCCESS"), None);
    }
}
