//! Payment API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::AuthenticatedUser;
use crate::models::{ApiResponse, Pagination};
use crate::payment::model::{
    ConfirmCashRequest, InitiatePaymentRequest, VerificationResult, VerifyEsewaRequest,
    VerifyKhaltiRequest,
};
use crate::payment::{GatewayTransaction, Payment, PaymentInitiation, PaymentService};

pub async fn initiate_payment(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentInitiation>>), ApiError> {
    let initiation = service.initiate(user.actor(), request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(initiation))))
}

pub async fn verify_khalti(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Json(request): Json<VerifyKhaltiRequest>,
) -> Result<Json<ApiResponse<VerificationResult>>, ApiError> {
    let result = service.verify_khalti(user.actor(), &request.pidx).await?;
    Ok(Json(ApiResponse::ok(result)))
}

pub async fn verify_esewa(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Json(request): Json<VerifyEsewaRequest>,
) -> Result<Json<ApiResponse<VerificationResult>>, ApiError> {
    let result = service.verify_esewa(user.actor(), &request.data).await?;
    Ok(Json(ApiResponse::ok(result)))
}

pub async fn confirm_cash(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<ConfirmCashRequest>,
) -> Result<Json<ApiResponse<Payment>>, ApiError> {
    let payment = service
        .confirm_cash(booking_id, user.actor(), request)
        .await?;
    Ok(Json(ApiResponse::ok(payment)))
}

pub async fn get_transaction(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<GatewayTransaction>>, ApiError> {
    let txn = service.get_transaction(id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(txn)))
}

pub async fn transaction_history(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Query(pagination): Query<Pagination>,
) -> Result<Json<ApiResponse<Vec<GatewayTransaction>>>, ApiError> {
    let txns = service.history(user.actor(), pagination).await?;
    Ok(Json(ApiResponse::ok(txns)))
}

pub async fn get_payment(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Payment>>, ApiError> {
    let payment = service.get_payment(booking_id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(payment)))
}

pub async fn list_transactions(
    State(service): State<Arc<PaymentService>>,
    user: AuthenticatedUser,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<GatewayTransaction>>>, ApiError> {
    let txns = service.list_transactions(booking_id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(txns)))
}
