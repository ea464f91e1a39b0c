use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dotenv::dotenv;
use serde_json::json;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

use shopflow_backend::api;
use shopflow_backend::config::AppConfig;
use shopflow_backend::database::init_pool_from_config;
use shopflow_backend::database::order_repository::OrderRepository;
use shopflow_backend::database::transaction_repository::TransactionRepository;
use shopflow_backend::database::webhook_event_repository::WebhookEventRepository;
use shopflow_backend::health::HealthChecker;
use shopflow_backend::logging::init_tracing;
use shopflow_backend::middleware::logging::{request_logging_middleware, UuidRequestId};
use shopflow_backend::payments::factory::PaymentProviderFactory;
use shopflow_backend::services::{OrchestratorConfig, PaymentOrchestrator, WebhookProcessor};
use shopflow_backend::workers::payment_reconciler::{PaymentReconcilerWorker, ReconcilerConfig};

#[derive(Clone)]
struct AppState {
    health_checker: HealthChecker,
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "shopflow-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health_checker.check_health().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health_checker.check_health().await;
    if status.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
    }
}

async fn liveness_check() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("🛑 Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            info!("🛑 SIGTERM received, starting graceful shutdown");
        },
    }
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    info!("📢 Notifying background workers to stop...");
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "🚀 Starting ShopFlow Backend Server"
    );

    let config = AppConfig::from_env()?;
    config.validate()?;

    info!("📊 Connecting to database...");
    let db_pool = init_pool_from_config(&config.database).await?;
    info!("✅ Database connection pool initialized");

    // Provider credentials are resolved and checked here so a bad
    // deployment dies at startup instead of on the first payment.
    let factory = PaymentProviderFactory::from_env()?;
    let providers = factory.build_enabled()?;
    info!(
        providers = ?factory.list_available_providers(),
        default = %factory.default_provider_name(),
        "✅ Payment providers configured"
    );

    let order_repo = Arc::new(OrderRepository::new(db_pool.clone()));
    let transaction_repo = Arc::new(TransactionRepository::new(db_pool.clone()));
    let event_repo = Arc::new(WebhookEventRepository::new(db_pool.clone()));

    let mut orchestrator_config = OrchestratorConfig::from_env();
    orchestrator_config.public_base_url = config.server.public_base_url.clone();

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        providers.clone(),
        factory.default_provider_name(),
        order_repo,
        transaction_repo.clone(),
        orchestrator_config,
    ));

    let webhook_processor = Arc::new(WebhookProcessor::new(
        providers,
        orchestrator.clone(),
        event_repo,
    ));

    let health_checker = HealthChecker::new(db_pool.clone(), factory.list_available_providers());

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);

    let reconciler_enabled = std::env::var("RECONCILER_ENABLED")
        .map(|v| v.to_lowercase() != "false")
        .unwrap_or(true);

    let reconciler_handle = if reconciler_enabled {
        let worker = PaymentReconcilerWorker::new(
            orchestrator.clone(),
            webhook_processor.clone(),
            transaction_repo.clone(),
            ReconcilerConfig::from_env(),
        );
        info!("🔄 Payment reconciler worker starting");
        Some(tokio::spawn(worker.run(worker_shutdown_rx)))
    } else {
        warn!("⚠️ Payment reconciler disabled via RECONCILER_ENABLED=false");
        None
    };

    let payment_routes = api::payments::router(api::payments::PaymentApiState {
        orchestrator: orchestrator.clone(),
        webhook_processor: webhook_processor.clone(),
    });

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .route("/health/live", get(liveness_check))
        .with_state(AppState { health_checker })
        .merge(payment_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    info!("🛣️ Payment routes registered: /payments/initiate, /payments/verify, /payments/callback");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║           🚀 SHOPFLOW BACKEND SERVER IS RUNNING 🚀           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listening on: http://{:<38} ║", addr);
    println!("║  Health check: http://{:<38} ║", format!("{}/health", addr));
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    info!("🏥 Health check available at http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    if let Some(handle) = reconciler_handle {
        info!("⏳ Waiting for payment reconciler to stop...");
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => info!("✅ Payment reconciler stopped cleanly"),
            Ok(Err(e)) => error!("❌ Payment reconciler task failed: {}", e),
            Err(_) => warn!("⚠️ Payment reconciler did not stop within 5s, abandoning"),
        }
    }

    info!("👋 Server shutdown complete");
    Ok(())
}
