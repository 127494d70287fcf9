use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::gateways::http::{safe_json, send_with_retry, MAX_ATTEMPTS};
use crate::gateways::traits::{BulkPayoutOutcome, PayoutGateway, PayoutOutcome};
use crate::ledger::models::{PaymentBatch, Provider, WalletTransaction};
use crate::ledger::repository::{LedgerRepository, NewPayoutLog};

/// Convert a KES amount to USD at a fixed operator-configured rate,
/// rounded half-up to cents
pub fn convert_kes_to_usd(amount_kes: Decimal, kes_per_usd: Decimal) -> Option<Decimal> {
    if kes_per_usd <= Decimal::ZERO {
        return None;
    }
    let usd = (amount_kes / kes_per_usd)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    (usd > Decimal::ZERO).then_some(usd)
}

/// Idempotency value for the PayPal-Request-Id header. A random suffix is
/// appended so an operator can force a genuinely new attempt after a
/// permanent rejection of the same entry.
pub fn request_id_for_tx(tx_id: Uuid, suffix: u32) -> String {
    format!("paypal-payout-tx-{}-{}", tx_id, suffix)
}

/// PayPal payouts gateway: email-addressed USD transfers via the Payouts
/// API, OAuth client-credentials auth per call
pub struct PayPalGateway {
    client: reqwest::Client,
    oauth_url: String,
    payouts_url: String,
    verify_webhook_url: String,
    client_id: String,
    secret: String,
    webhook_id: String,
    kes_usd_rate: Option<Decimal>,
    ledger: Arc<LedgerRepository>,
}

impl PayPalGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oauth_url: String,
        payouts_url: String,
        verify_webhook_url: String,
        client_id: String,
        secret: String,
        webhook_id: String,
        kes_usd_rate: Option<Decimal>,
        ledger: Arc<LedgerRepository>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            oauth_url,
            payouts_url,
            verify_webhook_url,
            client_id,
            secret,
            webhook_id,
            kes_usd_rate,
            ledger,
        }
    }

    async fn access_token(&self) -> AppResult<Option<String>> {
        let request = self
            .client
            .post(&self.oauth_url)
            .basic_auth(&self.client_id, Some(&self.secret))
            .form(&[("grant_type", "client_credentials")]);

        let resp = match send_with_retry(request, MAX_ATTEMPTS).await {
            Ok(resp) => resp,
            Err(exc) => {
                error!("PayPal OAuth HTTP error: {}", exc);
                return Ok(None);
            }
        };

        let status = resp.status();
        let data = safe_json(resp).await;

        if status.is_success() {
            if let Some(token) = data["access_token"].as_str() {
                return Ok(Some(token.to_string()));
            }
        }

        error!("PayPal OAuth failed status={}", status);
        Ok(None)
    }

    /// Receiver email for the entry's user. None means no payout destination.
    async fn receiver_email(&self, user_id: Uuid) -> AppResult<Option<String>> {
        let Some(profile) = self.ledger.get_profile(user_id).await? else {
            error!("Profile missing for user {}", user_id);
            return Ok(None);
        };
        match profile.email {
            Some(email) if !email.trim().is_empty() => Ok(Some(email)),
            _ => {
                error!("No email on profile for user {}", user_id);
                Ok(None)
            }
        }
    }

    fn usd_amount(&self, amount_kes: Decimal) -> Result<Decimal, String> {
        let Some(rate) = self.kes_usd_rate else {
            return Err("no_exchange_rate".to_string());
        };
        convert_kes_to_usd(amount_kes, rate)
            .ok_or_else(|| format!("invalid_amount: {} KES at rate {}", amount_kes, rate))
    }

    async fn post_payouts(
        &self,
        token: &str,
        request_id: &str,
        payload: &serde_json::Value,
    ) -> AppResult<(Option<u16>, serde_json::Value)> {
        let request = self
            .client
            .post(&self.payouts_url)
            .bearer_auth(token)
            .header("PayPal-Request-Id", request_id)
            .json(payload)
            .timeout(Duration::from_secs(60));

        let resp = match send_with_retry(request, MAX_ATTEMPTS).await {
            Ok(resp) => resp,
            Err(exc) => {
                error!("PayPal payouts HTTP error: {}", exc);
                return Ok((None, serde_json::json!({ "error": exc.to_string() })));
            }
        };

        let status = resp.status().as_u16();
        let data = safe_json(resp).await;
        Ok((Some(status), data))
    }
}

#[async_trait]
impl PayoutGateway for PayPalGateway {
    fn provider(&self) -> Provider {
        Provider::Paypal
    }

    async fn payout(
        &self,
        entry: &WalletTransaction,
        idempotency_key: Option<String>,
    ) -> AppResult<PayoutOutcome> {
        info!("PayPal single payout tx={}", entry.id);

        let request_id = idempotency_key
            .unwrap_or_else(|| request_id_for_tx(entry.id, rand::random::<u32>()));

        let outcome = self.payout_inner(entry, &request_id).await?;

        self.ledger
            .insert_log(NewPayoutLog {
                provider: Provider::Paypal,
                endpoint: "payouts".to_string(),
                wallet_transaction_id: Some(entry.id),
                batch_id: entry.batch_id,
                request_payload: serde_json::json!({ "transaction": entry.id.to_string() }),
                response_payload: outcome.raw.clone(),
                status_code: None,
                idempotency_key: Some(request_id),
                error: outcome.error.clone(),
            })
            .await?;

        Ok(outcome)
    }

    async fn bulk_payout_batch(
        &self,
        batch: &PaymentBatch,
        entries: &[WalletTransaction],
    ) -> AppResult<BulkPayoutOutcome> {
        info!("PayPal bulk payout batch={}", batch.reference);

        let mut items = Vec::new();
        let mut skipped = Vec::new();

        for entry in entries {
            let Some(email) = self.receiver_email(entry.user_id).await? else {
                warn!("Skipping tx {}: no receiver email", entry.id);
                skipped.push((entry.id, "no_receiver_email".to_string()));
                continue;
            };

            let usd = match self.usd_amount(entry.amount) {
                Ok(usd) => usd,
                Err(reason) => {
                    warn!("Skipping tx {}: {}", entry.id, reason);
                    skipped.push((entry.id, reason));
                    continue;
                }
            };

            items.push(serde_json::json!({
                "recipient_type": "EMAIL",
                "amount": { "value": usd.to_string(), "currency": "USD" },
                "receiver": email,
                "sender_item_id": entry.id.to_string(),
                "note": format!(
                    "Payout for job {}",
                    entry.job_id.map(|id| id.to_string()).unwrap_or_default()
                ),
            }));
        }

        let request_id = format!("paypal-batch-{}", batch.reference);

        if items.is_empty() {
            let outcome = BulkPayoutOutcome {
                success: false,
                provider_batch_ref: None,
                raw: serde_json::Value::Null,
                error: Some("no_valid_transfers".to_string()),
                skipped,
            };
            self.log_bulk(batch, &serde_json::Value::Null, &outcome, &request_id, None)
                .await?;
            return Ok(outcome);
        }

        let payload = serde_json::json!({
            "sender_batch_header": {
                "sender_batch_id": batch.reference,
                "email_subject": "You have a payout",
            },
            "items": items,
        });

        let Some(token) = self.access_token().await? else {
            let outcome = BulkPayoutOutcome {
                success: false,
                provider_batch_ref: None,
                raw: serde_json::Value::Null,
                error: Some("oauth_failed".to_string()),
                skipped,
            };
            self.log_bulk(batch, &payload, &outcome, &request_id, None).await?;
            return Ok(outcome);
        };

        let (status_code, data) = self.post_payouts(&token, &request_id, &payload).await?;

        let batch_ref = data["batch_header"]["payout_batch_id"]
            .as_str()
            .map(str::to_string);

        let success = status_code.map(|s| s < 400).unwrap_or(false) && batch_ref.is_some();

        let outcome = BulkPayoutOutcome {
            success,
            provider_batch_ref: batch_ref,
            error: if success {
                None
            } else {
                Some(
                    data["message"]
                        .as_str()
                        .or(data["name"].as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| data.to_string()),
                )
            },
            raw: data.clone(),
            skipped,
        };

        if !outcome.success {
            error!(
                "PayPal bulk payout failed batch={} err={:?}",
                batch.reference, outcome.error
            );
        }

        self.log_bulk(batch, &payload, &outcome, &request_id, status_code.map(|s| s as i32))
            .await?;

        Ok(outcome)
    }

    async fn verify_webhook(&self, headers: &HeaderMap, raw_body: &[u8]) -> bool {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let (Some(transmission_id), Some(transmission_time), Some(cert_url), Some(auth_algo), Some(transmission_sig)) = (
            header("paypal-transmission-id"),
            header("paypal-transmission-time"),
            header("paypal-cert-url"),
            header("paypal-auth-algo"),
            header("paypal-transmission-sig"),
        ) else {
            warn!("Missing PayPal webhook verification headers");
            return false;
        };

        let Ok(webhook_event) = serde_json::from_slice::<serde_json::Value>(raw_body) else {
            warn!("PayPal webhook body is not JSON");
            return false;
        };

        let Ok(Some(token)) = self.access_token().await else {
            return false;
        };

        let payload = serde_json::json!({
            "transmission_id": transmission_id,
            "transmission_time": transmission_time,
            "cert_url": cert_url,
            "auth_algo": auth_algo,
            "transmission_sig": transmission_sig,
            "webhook_id": self.webhook_id,
            "webhook_event": webhook_event,
        });

        let request = self
            .client
            .post(&self.verify_webhook_url)
            .bearer_auth(&token)
            .json(&payload);

        let resp = match send_with_retry(request, MAX_ATTEMPTS).await {
            Ok(resp) => resp,
            Err(exc) => {
                error!("PayPal webhook verification HTTP error: {}", exc);
                return false;
            }
        };

        let data = safe_json(resp).await;
        data["verification_status"].as_str() == Some("SUCCESS")
    }

    async fn fetch_bulk_status(&self, provider_reference: &str) -> AppResult<serde_json::Value> {
        let Some(token) = self.access_token().await? else {
            return Ok(serde_json::json!({ "error": "oauth_failed" }));
        };

        let url = format!("{}/{}", self.payouts_url, provider_reference);
        let resp = send_with_retry(self.client.get(&url).bearer_auth(&token), MAX_ATTEMPTS).await?;
        Ok(safe_json(resp).await)
    }
}

impl PayPalGateway {
    async fn payout_inner(
        &self,
        entry: &WalletTransaction,
        request_id: &str,
    ) -> AppResult<PayoutOutcome> {
        let usd = match self.usd_amount(entry.amount) {
            Ok(usd) => usd,
            Err(reason) => {
                error!("PayPal payout tx={} rejected: {}", entry.id, reason);
                return Ok(PayoutOutcome::failure(serde_json::Value::Null, reason));
            }
        };

        let Some(email) = self.receiver_email(entry.user_id).await? else {
            return Ok(PayoutOutcome::failure(
                serde_json::Value::Null,
                "no_receiver_email",
            ));
        };

        let payload = serde_json::json!({
            "sender_batch_header": {
                "sender_batch_id": format!("tx-{}", entry.id),
                "email_subject": "You have a payout",
            },
            "items": [{
                "recipient_type": "EMAIL",
                "amount": { "value": usd.to_string(), "currency": "USD" },
                "receiver": email,
                "sender_item_id": entry.id.to_string(),
            }],
        });

        let Some(token) = self.access_token().await? else {
            return Ok(PayoutOutcome::failure(
                serde_json::Value::Null,
                "oauth_failed",
            ));
        };

        let (status_code, data) = self.post_payouts(&token, request_id, &payload).await?;

        let provider_ref = data["batch_header"]["payout_batch_id"]
            .as_str()
            .map(str::to_string);

        if status_code.map(|s| s < 400).unwrap_or(false) && provider_ref.is_some() {
            return Ok(PayoutOutcome {
                success: true,
                provider_ref,
                raw: data,
                error: None,
            });
        }

        let err = data["message"]
            .as_str()
            .or(data["name"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string());
        warn!("PayPal single payout failed tx={} err={}", entry.id, err);
        Ok(PayoutOutcome::failure(data, err))
    }

    async fn log_bulk(
        &self,
        batch: &PaymentBatch,
        request_payload: &serde_json::Value,
        outcome: &BulkPayoutOutcome,
        request_id: &str,
        status_code: Option<i32>,
    ) -> AppResult<()> {
        self.ledger
            .insert_log(NewPayoutLog {
                provider: Provider::Paypal,
                endpoint: "payouts".to_string(),
                wallet_transaction_id: None,
                batch_id: Some(batch.id),
                request_payload: request_payload.clone(),
                response_payload: outcome.raw.clone(),
                status_code,
                idempotency_key: Some(request_id.to_string()),
                error: outcome.error.clone(),
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_convert_kes_to_usd() {
        assert_eq!(convert_kes_to_usd(dec!(1290), dec!(129)), Some(dec!(10.00)));
        assert_eq!(convert_kes_to_usd(dec!(100), dec!(129)), Some(dec!(0.78)));
        // half-up at the cent boundary
        assert_eq!(convert_kes_to_usd(dec!(0.645), dec!(129)), Some(dec!(0.01)));
        assert_eq!(convert_kes_to_usd(dec!(1000), dec!(0)), None);
        assert_eq!(convert_kes_to_usd(dec!(1000), dec!(-1)), None);
        assert_eq!(convert_kes_to_usd(dec!(0), dec!(129)), None);
    }

    #[test]
    fn test_request_id_includes_suffix() {
        let id = Uuid::nil();
        let a = request_id_for_tx(id, 1);
        let b = request_id_for_tx(id, 2);
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("paypal-payout-tx-{}", id)));
    }
}
