use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sha2::Sha512;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::gateways::http::{safe_json, send_with_retry, MAX_ATTEMPTS};
use crate::gateways::traits::{BulkPayoutOutcome, PayoutGateway, PayoutOutcome};
use crate::ledger::models::{PaymentBatch, Provider, WalletTransaction};
use crate::ledger::repository::{LedgerRepository, NewPayoutLog};

type HmacSha512 = Hmac<Sha512>;

/// Normalize a Kenyan phone number to international format (2547xxxxxxxx).
/// Returns None when the number cannot be normalized - that entry has no
/// payout destination.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let p: String = phone
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();

    if !p.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    match (p.len(), p.as_str()) {
        (10, s) if s.starts_with('0') => Some(format!("254{}", &s[1..])),
        (9, s) if s.starts_with('7') => Some(format!("254{}", s)),
        (12, s) if s.starts_with("254") => Some(s.to_string()),
        _ => None,
    }
}

/// Map a free-form mobile-money provider name onto a Paystack bank code
pub fn map_mobile_provider(provider: Option<&str>) -> &'static str {
    let Some(v) = provider else { return "MPESA" };
    let v = v.trim().to_ascii_lowercase();

    if v.contains("airtel") {
        "AIRTEL"
    } else if v.contains("equit") {
        "EQUITEL"
    } else {
        "MPESA"
    }
}

/// Deterministic idempotency key for a single transfer
pub fn idempotency_key_for_tx(batch_reference: Option<&str>, tx_id: Uuid) -> String {
    format!(
        "paystack-payout-{}-tx-{}",
        batch_reference.unwrap_or("no-batch"),
        tx_id
    )
}

/// Deterministic idempotency key for a bulk transfer
pub fn idempotency_key_for_batch(batch_reference: &str) -> String {
    format!("paystack-batch-{}", batch_reference)
}

/// Constant-time HMAC-SHA512 check of a webhook body against the signature
/// header value
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Net amount in minor units (kobo/cents). None for malformed amounts.
fn amount_minor(amount: Decimal) -> Option<i64> {
    (amount * Decimal::from(100)).round().to_i64().filter(|v| *v > 0)
}

/// Paystack payout gateway: mobile-money transfers in KES, bulk fan-out
/// with per-transfer webhooks
pub struct PaystackGateway {
    client: reqwest::Client,
    base_url: String,
    webhook_secret: String,
    ledger: Arc<LedgerRepository>,
}

impl PaystackGateway {
    pub fn new(
        base_url: String,
        secret_key: String,
        webhook_secret: Option<String>,
        ledger: Arc<LedgerRepository>,
    ) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(auth) = format!("Bearer {}", secret_key).parse() {
            headers.insert(reqwest::header::AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url,
            webhook_secret: webhook_secret.unwrap_or(secret_key),
            ledger,
        }
    }

    /// Resolve the user's transfer recipient code, provisioning one at the
    /// provider on first use and caching it on the profile. Ok(None) means
    /// the user has no resolvable payout destination.
    async fn get_or_create_recipient(&self, user_id: Uuid) -> AppResult<Option<String>> {
        let Some(profile) = self.ledger.get_profile(user_id).await? else {
            error!("Profile missing for user {}", user_id);
            return Ok(None);
        };

        if let Some(code) = &profile.paystack_recipient {
            return Ok(Some(code.clone()));
        }

        let Some(phone) = profile.phone.as_deref().and_then(normalize_phone) else {
            error!(
                "Invalid phone for user {} phone={:?}",
                user_id, profile.phone
            );
            return Ok(None);
        };

        let payload = serde_json::json!({
            "type": "mobile_money",
            "name": profile.display_name(),
            "account_number": phone,
            "bank_code": map_mobile_provider(profile.mobile_money_provider.as_deref()),
            "currency": "KES",
        });

        match self.create_transfer_recipient(&payload).await? {
            Some(code) => {
                self.ledger.save_paystack_recipient(user_id, &code).await?;
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    async fn create_transfer_recipient(
        &self,
        payload: &serde_json::Value,
    ) -> AppResult<Option<String>> {
        let url = format!("{}/transferrecipient", self.base_url);

        let (code, status_code, data, error_text) =
            match send_with_retry(self.client.post(&url).json(payload), MAX_ATTEMPTS).await {
                Ok(resp) => {
                    let status = resp.status();
                    let data = safe_json(resp).await;

                    let code = if status.is_success() && data["status"].as_bool() == Some(true) {
                        data["data"]["recipient_code"].as_str().map(str::to_string)
                    } else {
                        None
                    };

                    let error_text = if code.is_none() {
                        error!("Recipient creation failed status={}", status);
                        Some(format!("recipient_creation_failed: {}", status))
                    } else {
                        None
                    };

                    (code, Some(status.as_u16() as i32), data, error_text)
                }
                Err(exc) => {
                    error!("HTTP error creating transfer recipient: {}", exc);
                    (None, None, serde_json::Value::Null, Some(exc.to_string()))
                }
            };

        self.ledger
            .insert_log(NewPayoutLog {
                provider: Provider::Paystack,
                endpoint: "transferrecipient".to_string(),
                wallet_transaction_id: None,
                batch_id: None,
                request_payload: payload.clone(),
                response_payload: data,
                status_code,
                idempotency_key: None,
                error: error_text,
            })
            .await?;

        Ok(code)
    }

}

#[async_trait]
impl PayoutGateway for PaystackGateway {
    fn provider(&self) -> Provider {
        Provider::Paystack
    }

    async fn payout(
        &self,
        entry: &WalletTransaction,
        idempotency_key: Option<String>,
    ) -> AppResult<PayoutOutcome> {
        info!("Paystack single payout tx={}", entry.id);

        let idem_key =
            idempotency_key.unwrap_or_else(|| idempotency_key_for_tx(None, entry.id));

        let outcome = self.payout_inner(entry, &idem_key).await?;

        self.ledger
            .insert_log(NewPayoutLog {
                provider: Provider::Paystack,
                endpoint: "transfer".to_string(),
                wallet_transaction_id: Some(entry.id),
                batch_id: entry.batch_id,
                request_payload: serde_json::json!({ "transaction": entry.id.to_string() }),
                response_payload: outcome.raw.clone(),
                status_code: None,
                idempotency_key: Some(idem_key),
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
        info!("Paystack bulk payout batch={}", batch.reference);

        let mut transfers = Vec::new();
        let mut skipped = Vec::new();

        for entry in entries {
            let Some(recipient) = self.get_or_create_recipient(entry.user_id).await? else {
                warn!("Skipping tx {}: no recipient", entry.id);
                skipped.push((entry.id, "no_recipient".to_string()));
                continue;
            };

            let Some(minor) = amount_minor(entry.amount) else {
                warn!("Skipping tx {}: invalid amount {}", entry.id, entry.amount);
                skipped.push((entry.id, format!("invalid_amount: {}", entry.amount)));
                continue;
            };

            transfers.push(serde_json::json!({
                "amount": minor,
                "recipient": recipient,
                "reference": format!("{}:{}", batch.reference, entry.id),
                "reason": format!(
                    "Payout for job {}",
                    entry.job_id.map(|id| id.to_string()).unwrap_or_default()
                ),
            }));
        }

        let idem_key = idempotency_key_for_batch(&batch.reference);

        if transfers.is_empty() {
            let outcome = BulkPayoutOutcome {
                success: false,
                provider_batch_ref: None,
                raw: serde_json::Value::Null,
                error: Some("no_valid_transfers".to_string()),
                skipped,
            };
            self.log_bulk(batch, &serde_json::Value::Null, &outcome, &idem_key, None)
                .await?;
            return Ok(outcome);
        }

        let payload = serde_json::json!({
            "source": "balance",
            "currency": "KES",
            "transfers": transfers,
        });

        let url = format!("{}/transfer/bulk", self.base_url);
        let request = self
            .client
            .post(&url)
            .json(&payload)
            .header("Idempotency-Key", &idem_key)
            .timeout(Duration::from_secs(60));

        let resp = match send_with_retry(request, MAX_ATTEMPTS).await {
            Ok(resp) => resp,
            Err(exc) => {
                error!("Paystack bulk payout HTTP error batch={}: {}", batch.reference, exc);
                let outcome = BulkPayoutOutcome {
                    success: false,
                    provider_batch_ref: None,
                    raw: serde_json::Value::Null,
                    error: Some(exc.to_string()),
                    skipped,
                };
                self.log_bulk(batch, &payload, &outcome, &idem_key, None).await?;
                return Ok(outcome);
            }
        };

        let status = resp.status();
        let data = safe_json(resp).await;

        let outcome = if status.is_success() && data["status"].as_bool() == Some(true) {
            // Bulk response: data is a list, batch_code lives in meta
            let bulk_code = data["meta"]["batch_code"].as_str().map(str::to_string);

            for t in data["data"].as_array().into_iter().flatten() {
                info!(
                    "Queued transfer | ref={} code={} status={}",
                    t["reference"].as_str().unwrap_or(""),
                    t["transfer_code"].as_str().unwrap_or(""),
                    t["status"].as_str().unwrap_or(""),
                );
            }

            BulkPayoutOutcome {
                success: bulk_code.is_some(),
                provider_batch_ref: bulk_code,
                error: None,
                raw: data.clone(),
                skipped,
            }
        } else {
            let err = data["message"]
                .as_str()
                .or(data["error"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| data.to_string());
            error!("Paystack bulk payout failed batch={} err={}", batch.reference, err);
            BulkPayoutOutcome {
                success: false,
                provider_batch_ref: None,
                error: Some(err),
                raw: data.clone(),
                skipped,
            }
        };

        self.log_bulk(batch, &payload, &outcome, &idem_key, Some(status.as_u16() as i32))
            .await?;

        Ok(outcome)
    }

    async fn verify_webhook(&self, headers: &HeaderMap, raw_body: &[u8]) -> bool {
        let Some(signature) = headers
            .get("x-paystack-signature")
            .and_then(|v| v.to_str().ok())
        else {
            warn!("Missing Paystack webhook signature");
            return false;
        };

        verify_signature(&self.webhook_secret, raw_body, signature)
    }

    async fn fetch_bulk_status(&self, provider_reference: &str) -> AppResult<serde_json::Value> {
        let url = format!("{}/transfer/bulk/{}", self.base_url, provider_reference);
        let resp = send_with_retry(self.client.get(&url), MAX_ATTEMPTS).await?;
        Ok(safe_json(resp).await)
    }
}

impl PaystackGateway {
    async fn payout_inner(
        &self,
        entry: &WalletTransaction,
        idem_key: &str,
    ) -> AppResult<PayoutOutcome> {
        let Some(minor) = amount_minor(entry.amount) else {
            let err = format!("Invalid amount for tx {}: {}", entry.id, entry.amount);
            error!("{}", err);
            return Ok(PayoutOutcome::failure(serde_json::Value::Null, err));
        };

        let Some(recipient) = self.get_or_create_recipient(entry.user_id).await? else {
            return Ok(PayoutOutcome::failure(
                serde_json::Value::Null,
                "no_recipient",
            ));
        };

        let payload = serde_json::json!({
            "source": "balance",
            "amount": minor,
            "recipient": recipient,
            "reason": format!(
                "Payout for job {}",
                entry.job_id.map(|id| id.to_string()).unwrap_or_default()
            ),
        });

        let url = format!("{}/transfer", self.base_url);
        let request = self
            .client
            .post(&url)
            .json(&payload)
            .header("Idempotency-Key", idem_key);

        let resp = match send_with_retry(request, MAX_ATTEMPTS).await {
            Ok(resp) => resp,
            Err(exc) => {
                error!("Paystack single payout HTTP error tx={}: {}", entry.id, exc);
                return Ok(PayoutOutcome::failure(
                    serde_json::Value::Null,
                    exc.to_string(),
                ));
            }
        };

        let status = resp.status();
        let data = safe_json(resp).await;

        if status.is_success() && data["status"].as_bool() == Some(true) {
            let provider_ref = data["data"]["reference"]
                .as_str()
                .or(data["data"]["transfer_code"].as_str())
                .map(str::to_string);

            return Ok(PayoutOutcome {
                success: true,
                provider_ref,
                raw: data,
                error: None,
            });
        }

        let err = data["message"]
            .as_str()
            .or(data["error"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string());
        warn!("Paystack single payout failed tx={} err={}", entry.id, err);
        Ok(PayoutOutcome::failure(data, err))
    }

    async fn log_bulk(
        &self,
        batch: &PaymentBatch,
        request_payload: &serde_json::Value,
        outcome: &BulkPayoutOutcome,
        idem_key: &str,
        status_code: Option<i32>,
    ) -> AppResult<()> {
        self.ledger
            .insert_log(NewPayoutLog {
                provider: Provider::Paystack,
                endpoint: "transfer/bulk".to_string(),
                wallet_transaction_id: None,
                batch_id: Some(batch.id),
                request_payload: request_payload.clone(),
                response_payload: outcome.raw.clone(),
                status_code,
                idempotency_key: Some(idem_key.to_string()),
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
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("0712345678"), Some("254712345678".into()));
        assert_eq!(normalize_phone("712345678"), Some("254712345678".into()));
        assert_eq!(normalize_phone("254712345678"), Some("254712345678".into()));
        assert_eq!(normalize_phone("+254712345678"), Some("254712345678".into()));
        assert_eq!(normalize_phone("0712 345 678"), Some("254712345678".into()));
        assert_eq!(normalize_phone("0712-345-678"), Some("254712345678".into()));
        assert_eq!(normalize_phone("12345"), None);
        assert_eq!(normalize_phone("07123456xx"), None);
        assert_eq!(normalize_phone(""), None);
    }

    #[test]
    fn test_map_mobile_provider() {
        assert_eq!(map_mobile_provider(Some("mpesa")), "MPESA");
        assert_eq!(map_mobile_provider(Some("M-Pesa")), "MPESA");
        assert_eq!(map_mobile_provider(Some("Airtel Money")), "AIRTEL");
        assert_eq!(map_mobile_provider(Some("equitel")), "EQUITEL");
        assert_eq!(map_mobile_provider(Some("unknown")), "MPESA");
        assert_eq!(map_mobile_provider(None), "MPESA");
    }

    #[test]
    fn test_idempotency_keys_deterministic() {
        let id = Uuid::nil();
        assert_eq!(
            idempotency_key_for_tx(Some("ref1"), id),
            format!("paystack-payout-ref1-tx-{}", id)
        );
        assert_eq!(
            idempotency_key_for_tx(None, id),
            format!("paystack-payout-no-batch-tx-{}", id)
        );
        assert_eq!(idempotency_key_for_batch("abc"), "paystack-batch-abc");
        // repeated derivation yields the same key
        assert_eq!(
            idempotency_key_for_tx(Some("ref1"), id),
            idempotency_key_for_tx(Some("ref1"), id)
        );
    }

    #[test]
    fn test_verify_signature_roundtrip() {
        let secret = "sk_test_secret";
        let body = br#"{"event":"transfer.success"}"#;

        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_signature(secret, body, &signature));
        assert!(!verify_signature(secret, b"tampered", &signature));
        assert!(!verify_signature("wrong_secret", body, &signature));
        assert!(!verify_signature(secret, body, "not-hex"));
        assert!(!verify_signature(secret, body, ""));
    }

    #[test]
    fn test_amount_minor() {
        assert_eq!(amount_minor(dec!(900.00)), Some(90_000));
        assert_eq!(amount_minor(dec!(0.01)), Some(1));
        assert_eq!(amount_minor(dec!(33.335)), Some(3_334));
        assert_eq!(amount_minor(dec!(0)), None);
        assert_eq!(amount_minor(dec!(-5)), None);
    }
}
