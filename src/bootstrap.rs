use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    gateways::{paypal::PayPalGateway, paystack::PaystackGateway, registry::GatewayRegistry},
    ledger::repository::LedgerRepository,
    payouts::{
        discovery::BatchDiscoveryService,
        executor::BatchExecutor,
        finalizer::BatchFinalizer,
        intent::PayoutIntentService,
        retry::RetryService,
        scheduler::{PayoutScheduleConfig, PayoutScheduler},
    },
};
use crate::ledger::models::Provider;

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;
    let ledger = Arc::new(LedgerRepository::new(pool.clone()));

    // Gateways
    let mut registry = GatewayRegistry::new();

    let paystack = Arc::new(PaystackGateway::new(
        config.paystack_base_url.clone(),
        config.paystack_secret_key.clone(),
        config.paystack_webhook_secret.clone(),
        ledger.clone(),
    ));
    registry.register(paystack);
    info!("✅ Paystack gateway registered");

    let paypal = Arc::new(PayPalGateway::new(
        config.paypal_oauth_url.clone(),
        config.paypal_payouts_url.clone(),
        config.paypal_verify_webhook_url.clone(),
        config.paypal_client_id.clone(),
        config.paypal_secret.clone(),
        config.paypal_webhook_id.clone(),
        config.kes_usd_rate,
        ledger.clone(),
    ));
    registry.register(paypal);
    info!("✅ PayPal gateway registered");

    let registry = Arc::new(registry);

    // Payout services
    let intents = Arc::new(PayoutIntentService::new(ledger.clone()));
    let discovery = Arc::new(BatchDiscoveryService::new(ledger.clone()));
    let executor = Arc::new(BatchExecutor::new(ledger.clone(), registry.clone()));
    let retry = Arc::new(RetryService::new(ledger.clone(), registry.clone()));
    let finalizer = Arc::new(BatchFinalizer::new(ledger.clone()));

    // Background scheduler: periodic discovery + retry sweep
    let scheduler = PayoutScheduler::new(
        PayoutScheduleConfig {
            interval_minutes: config.scheduler_interval_minutes,
            discovery_provider: Provider::Paystack,
            discovery_enabled: true,
            retry_enabled: true,
        },
        discovery.clone(),
        retry.clone(),
    );
    scheduler.start();
    info!("✅ Payout scheduler started");

    Ok(AppState {
        ledger,
        registry,
        intents,
        discovery,
        executor,
        retry,
        finalizer,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("✓ Database ready");

    Ok(pool)
}
