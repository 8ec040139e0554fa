//! Booking API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::booking::model::{
    AddImagesRequest, CancelRequest, CompleteRequest, CreateBookingRequest, CreateReviewRequest,
    DeclineRequest, DisputeRequest, ListBookingsQuery, ScheduleRequest,
};
use crate::booking::{Booking, BookingDetail, BookingImage, BookingService, Review};
use crate::error::ApiError;
use crate::middleware::AuthenticatedUser;
use crate::models::ApiResponse;
use crate::state::AppState;

pub async fn create_booking(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Json(request): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BookingDetail>>), ApiError> {
    let detail = service.create_booking(user.actor(), request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(detail))))
}

pub async fn list_bookings(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Query(query): Query<ListBookingsQuery>,
) -> Result<Json<ApiResponse<Vec<Booking>>>, ApiError> {
    let bookings = service.list_bookings(user.actor(), query).await?;
    Ok(Json(ApiResponse::ok(bookings)))
}

pub async fn get_booking(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<BookingDetail>>, ApiError> {
    let detail = service.get_booking(id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(detail)))
}

pub async fn accept_booking(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let booking = service.accept(id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(booking)))
}

pub async fn decline_booking(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<DeclineRequest>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let booking = service.decline(id, user.actor(), request.reason).await?;
    Ok(Json(ApiResponse::ok(booking)))
}

pub async fn schedule_booking(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let booking = service
        .schedule(
            id,
            user.actor(),
            request.scheduled_date,
            request.scheduled_time,
        )
        .await?;
    Ok(Json(ApiResponse::ok(booking)))
}

pub async fn start_booking(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let booking = service.start(id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(booking)))
}

/// Completion also resettles an existing payment at the final price.
pub async fn complete_booking(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let booking = state
        .booking_service
        .complete(
            id,
            user.actor(),
            request.final_price,
            request.completion_note,
        )
        .await?;
    state.payment_service.handle_completion(&booking).await?;
    Ok(Json(ApiResponse::ok(booking)))
}

/// A dispute flags any settled payment for manual review.
pub async fn dispute_booking(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<DisputeRequest>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let booking = state
        .booking_service
        .dispute(id, user.actor(), request.reason.clone(), request.note)
        .await?;
    state
        .payment_service
        .handle_dispute(id, &request.reason)
        .await?;
    Ok(Json(ApiResponse::ok(booking)))
}

pub async fn cancel_booking(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let booking = service.cancel(id, user.actor(), request.reason).await?;
    Ok(Json(ApiResponse::ok(booking)))
}

#[derive(Debug, Deserialize)]
pub struct CheckConflictRequest {
    pub provider_id: Uuid,
    pub preferred_date: NaiveDate,
    pub preferred_time: NaiveTime,
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub emergency: bool,
}

/// Pre-flight conflict check before creating a booking.
pub async fn check_conflict(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Json(request): Json<CheckConflictRequest>,
) -> Result<Json<ApiResponse<crate::booking::ValidationReport>>, ApiError> {
    let report = service
        .checker()
        .validate_request(
            user.actor().user_id,
            request.provider_id,
            request.preferred_date,
            request.preferred_time,
            request.duration_minutes,
            request.emergency,
            Utc::now(),
        )
        .await?;
    Ok(Json(ApiResponse::ok(report)))
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub provider_id: Uuid,
    pub date: NaiveDate,
}

pub async fn available_slots(
    State(service): State<Arc<BookingService>>,
    _user: AuthenticatedUser,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<ApiResponse<Vec<NaiveTime>>>, ApiError> {
    let slots = service
        .checker()
        .available_slots(query.provider_id, query.date, Utc::now())
        .await?;
    Ok(Json(ApiResponse::ok(slots)))
}

#[derive(Debug, Deserialize)]
pub struct AlternativesQuery {
    pub provider_id: Uuid,
    pub from: NaiveDate,
}

pub async fn alternative_dates(
    State(service): State<Arc<BookingService>>,
    _user: AuthenticatedUser,
    Query(query): Query<AlternativesQuery>,
) -> Result<Json<ApiResponse<Vec<NaiveDate>>>, ApiError> {
    let dates = service
        .checker()
        .alternative_dates(query.provider_id, query.from, Utc::now())
        .await?;
    Ok(Json(ApiResponse::ok(dates)))
}

pub async fn add_images(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<AddImagesRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Vec<BookingImage>>>), ApiError> {
    let images = service.add_images(id, user.actor(), request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(images))))
}

pub async fn list_images(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<BookingImage>>>, ApiError> {
    let images = service.list_images(id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(images)))
}

pub async fn create_review(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<CreateReviewRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Review>>), ApiError> {
    let review = service.create_review(id, user.actor(), request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(review))))
}

pub async fn get_review(
    State(service): State<Arc<BookingService>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Review>>, ApiError> {
    let review = service.get_review(id, user.actor()).await?;
    Ok(Json(ApiResponse::ok(review)))
}
