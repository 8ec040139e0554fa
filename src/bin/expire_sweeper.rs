//! Batch expiry sweeper.
//!
//! Run from an external scheduler (cron, systemd timer) to expire pending
//! bookings whose confirmation deadline has lapsed. The online API also
//! expires lazily on read; this job catches bookings nobody looks at.
//!
//! Pass `--dry-run` to report how many rows would expire without touching
//! anything.

use std::sync::Arc;

use sewahub_server::booking::BookingService;
use sewahub_server::config::Config;
use sewahub_server::db;
use sewahub_server::notify::Notifier;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let dry_run = std::env::args().any(|arg| arg == "--dry-run");

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
        .init();

    let pool = match db::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            std::process::exit(1);
        }
    };

    let notifier = match Notifier::new(config.notify_webhook_url.clone()) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build notification client");
            std::process::exit(1);
        }
    };
    let service = Arc::new(BookingService::new(
        pool,
        config.booking_policy.clone(),
        notifier,
    ));

    match service.sweep_expired(dry_run).await {
        Ok(outcome) if dry_run => {
            tracing::info!(
                overdue = outcome.examined,
                "dry run: bookings that would expire"
            );
        }
        Ok(outcome) => {
            tracing::info!(
                examined = outcome.examined,
                expired = outcome.expired,
                notify_failures = outcome.notify_failures,
                "sweep finished"
            );
            if outcome.notify_failures > 0 {
                // Expiries persisted even where notification delivery failed.
                std::process::exit(2);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "sweep failed");
            std::process::exit(1);
        }
    }
}
