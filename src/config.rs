use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub paystack_base_url: String,
    pub paystack_secret_key: String,
    pub paystack_webhook_secret: Option<String>,
    pub paypal_oauth_url: String,
    pub paypal_payouts_url: String,
    pub paypal_verify_webhook_url: String,
    pub paypal_client_id: String,
    pub paypal_secret: String,
    pub paypal_webhook_id: String,
    /// Static KES -> USD conversion used for PayPal payouts
    pub kes_usd_rate: Option<Decimal>,
    /// Minutes between scheduled discovery/retry-sweep runs
    pub scheduler_interval_minutes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/payouts".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            paystack_base_url: std::env::var("PAYSTACK_BASE_URL")
                .unwrap_or_else(|_| "https://api.paystack.co".to_string()),
            paystack_secret_key: std::env::var("PAYSTACK_SECRET_KEY").unwrap_or_default(),
            paystack_webhook_secret: std::env::var("PAYSTACK_WEBHOOK_SECRET").ok(),
            paypal_oauth_url: std::env::var("PAYPAL_OAUTH_URL").unwrap_or_else(|_| {
                "https://api-m.paypal.com/v1/oauth2/token".to_string()
            }),
            paypal_payouts_url: std::env::var("PAYPAL_PAYOUTS_URL").unwrap_or_else(|_| {
                "https://api-m.paypal.com/v1/payments/payouts".to_string()
            }),
            paypal_verify_webhook_url: std::env::var("PAYPAL_VERIFY_WEBHOOK_URL")
                .unwrap_or_else(|_| {
                    "https://api-m.paypal.com/v1/notifications/verify-webhook-signature"
                        .to_string()
                }),
            paypal_client_id: std::env::var("PAYPAL_CLIENT_ID").unwrap_or_default(),
            paypal_secret: std::env::var("PAYPAL_SECRET").unwrap_or_default(),
            paypal_webhook_id: std::env::var("PAYPAL_WEBHOOK_ID").unwrap_or_default(),
            kes_usd_rate: std::env::var("KES_USD_RATE")
                .ok()
                .and_then(|v| Decimal::from_str(&v).ok()),
            scheduler_interval_minutes: std::env::var("SCHEDULER_INTERVAL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        })
    }
}
