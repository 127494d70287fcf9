use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer,
};
use tracing::info;

use crate::api::{
    handler::{
        create_batch, discover_batches, dispatch_batch, dispatch_batch_async, get_batch,
        get_transaction, health_check, job_assigned, job_completed, pay_single,
        reconcile_batch, run_retry_sweep, AppState,
    },
    webhook::{paypal_webhook, paystack_webhook},
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Inbound job-domain events
                .route("/events/job-completed", post(job_completed))
                .route("/events/job-assigned", post(job_assigned))
                // Provider webhooks (raw-body, signature verified)
                .route("/webhook/paystack", post(paystack_webhook))
                .route("/webhook/paypal", post(paypal_webhook))
                // Admin operations
                .route("/admin/batches/discover", post(discover_batches))
                .route("/admin/batches/create", post(create_batch))
                .route("/admin/batches/:id/dispatch", post(dispatch_batch))
                .route("/admin/batches/:id/dispatch-async", post(dispatch_batch_async))
                .route("/admin/batches/:id/reconcile", post(reconcile_batch))
                .route("/admin/transactions/:id/pay", post(pay_single))
                .route("/admin/retry-sweep", post(run_retry_sweep))
                // Read endpoints
                .route("/batches/:id", get(get_batch))
                .route("/transactions/:id", get(get_transaction)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
