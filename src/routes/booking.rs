//! Booking route definitions

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::booking::*;
use crate::state::AppState;

pub fn booking_routes() -> Router<AppState> {
    Router::new()
        .route("/api/bookings", post(create_booking).get(list_bookings))
        .route("/api/bookings/check-conflict", post(check_conflict))
        .route("/api/bookings/slots", get(available_slots))
        .route("/api/bookings/alternatives", get(alternative_dates))
        .route("/api/bookings/:id", get(get_booking))
        .route("/api/bookings/:id/accept", post(accept_booking))
        .route("/api/bookings/:id/decline", post(decline_booking))
        .route("/api/bookings/:id/schedule", post(schedule_booking))
        .route("/api/bookings/:id/start", post(start_booking))
        .route("/api/bookings/:id/complete", post(complete_booking))
        .route("/api/bookings/:id/dispute", post(dispute_booking))
        .route("/api/bookings/:id/cancel", post(cancel_booking))
        .route("/api/bookings/:id/images", post(add_images).get(list_images))
        .route("/api/bookings/:id/review", post(create_review).get(get_review))
}
