//! Payment route definitions

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::payment::*;
use crate::state::AppState;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/payments/initiate", post(initiate_payment))
        .route("/api/payments/khalti/verify", post(verify_khalti))
        .route("/api/payments/esewa/verify", post(verify_esewa))
        .route("/api/payments/history", get(transaction_history))
        .route("/api/payments/transactions/:id", get(get_transaction))
        .route(
            "/api/payments/bookings/:booking_id",
            get(get_payment),
        )
        .route(
            "/api/payments/bookings/:booking_id/confirm-cash",
            post(confirm_cash),
        )
        .route(
            "/api/payments/bookings/:booking_id/transactions",
            get(list_transactions),
        )
}
