//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::booking::BookingService;
use crate::middleware::JwtVerifier;
use crate::payment::PaymentService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub booking_service: Arc<BookingService>,
    pub payment_service: Arc<PaymentService>,
    pub jwt_verifier: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(
        booking_service: Arc<BookingService>,
        payment_service: Arc<PaymentService>,
        jwt_verifier: Arc<JwtVerifier>,
    ) -> Self {
        Self {
            booking_service,
            payment_service,
            jwt_verifier,
        }
    }
}

impl FromRef<AppState> for Arc<BookingService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.booking_service.clone()
    }
}

impl FromRef<AppState> for Arc<PaymentService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.payment_service.clone()
    }
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.jwt_verifier.clone()
    }
}
