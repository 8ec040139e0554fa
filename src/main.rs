//! SewaHub Backend Server
//!
//! HTTP entry point for the booking and payment APIs.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use axum::{routing::get, Json, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use sewahub_server::booking::BookingService;
use sewahub_server::config::Config;
use sewahub_server::db;
use sewahub_server::middleware::{request_tracing, JwtVerifier};
use sewahub_server::notify::Notifier;
use sewahub_server::payment::{EsewaGateway, KhaltiGateway, PaymentLedger, PaymentService};
use sewahub_server::routes::{booking_routes, payment_routes};
use sewahub_server::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .init();

    tracing::info!(database = %config.database_url_masked(), "Connecting to database...");
    let pool = match db::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            std::process::exit(1);
        }
    };
    if let Err(e) = db::run_migrations(&pool).await {
        tracing::error!(error = %e, "Failed to run migrations");
        std::process::exit(1);
    }

    let notifier = match Notifier::new(config.notify_webhook_url.clone()) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build notification client");
            std::process::exit(1);
        }
    };
    let booking_service = Arc::new(BookingService::new(
        pool.clone(),
        config.booking_policy.clone(),
        notifier,
    ));

    let gateway_timeout = Duration::from_secs(config.gateway_timeout_seconds);
    let khalti = match KhaltiGateway::new(config.khalti.clone(), gateway_timeout) {
        Ok(g) => g,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build khalti client");
            std::process::exit(1);
        }
    };
    let ledger = PaymentLedger::new(pool.clone(), config.booking_policy.platform_fee_percentage);
    let payment_service = Arc::new(PaymentService::new(
        pool.clone(),
        booking_service.as_ref().clone(),
        ledger,
        khalti,
        EsewaGateway::new(config.esewa.clone()),
    ));

    let jwt_verifier = Arc::new(JwtVerifier::new(&config.jwt_secret));
    let app_state = AppState::new(booking_service, payment_service, jwt_verifier);

    let cors = match &config.cors_allowed_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    let health_pool = pool.clone();
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let pool = health_pool.clone();
                async move {
                    match db::check_health(&pool).await {
                        Ok(()) => Json(serde_json::json!({ "status": "ok" })),
                        Err(_) => Json(serde_json::json!({ "status": "degraded" })),
                    }
                }
            }),
        )
        .merge(booking_routes())
        .merge(payment_routes())
        .layer(axum::middleware::from_fn(request_tracing))
        .layer(cors)
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %addr, environment = %config.environment.as_str(), "Server listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
