//! Booking models and data structures

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::UserRole;

/// Booking lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "booking_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,    // Waiting for provider response
    Confirmed,  // Provider accepted
    Scheduled,  // Provider set a confirmed date/time
    InProgress, // Work started
    Completed,  // Work finished
    Disputed,   // Customer disputed completion
    Cancelled,  // Cancelled by either party
    Declined,   // Provider declined
    Expired,    // Provider never responded before the deadline
}

impl BookingStatus {
    /// Terminal statuses admit no further transitions, with the single
    /// exception that a completed booking may still be disputed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Disputed
                | BookingStatus::Cancelled
                | BookingStatus::Declined
                | BookingStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Disputed => "disputed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Declined => "declined",
            BookingStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Booking model
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub status: BookingStatus,

    pub preferred_date: NaiveDate,
    pub preferred_time: NaiveTime,
    pub scheduled_date: Option<NaiveDate>,
    pub scheduled_time: Option<NaiveTime>,
    pub confirmation_deadline: DateTime<Utc>,
    pub emergency: bool,

    pub service_address: String,
    pub service_city: String,
    pub description: String,
    pub special_instructions: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,

    pub quoted_price: Option<Decimal>,
    pub final_price: Option<Decimal>,

    pub completion_note: Option<String>,
    pub dispute_reason: Option<String>,
    pub dispute_note: Option<String>,
    pub cancelled_by: Option<Uuid>,
    pub cancellation_reason: Option<String>,

    pub accepted_at: Option<DateTime<Utc>>,
    pub provider_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// The customer's requested service time. Booking-local dates and times
    /// are interpreted as UTC.
    pub fn preferred_datetime(&self) -> DateTime<Utc> {
        self.preferred_date
            .and_time(self.preferred_time)
            .and_utc()
    }

    /// Whether the pending booking has outlived its confirmation deadline
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Pending && now >= self.confirmation_deadline
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self.status,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Scheduled
        )
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.customer_id == user_id || self.provider_id == user_id
    }
}

/// Immutable snapshot of a catalog service captured at booking time
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct ServiceLine {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub service_id: Uuid,
    pub title: String,
    pub price: Decimal,
    pub duration_minutes: Option<i32>,
}

/// The acting user for a transition attempt
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: UserRole,
}

/// Service line supplied at creation; the catalog itself lives outside the
/// core, so the caller sends the snapshot values
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ServiceLineInput {
    pub service_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub price: Decimal,
    #[validate(range(min = 1, max = 1440))]
    pub duration_minutes: Option<i32>,
}

/// Request DTO for creating a booking
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingRequest {
    pub provider_id: Uuid,
    #[validate(length(min = 1))]
    pub services: Vec<ServiceLineInput>,
    pub preferred_date: NaiveDate,
    pub preferred_time: NaiveTime,
    #[serde(default)]
    pub emergency: bool,
    #[validate(length(min = 1, max = 255))]
    pub service_address: String,
    #[validate(length(min = 1, max = 100))]
    pub service_city: String,
    #[validate(length(min = 1))]
    pub description: String,
    pub special_instructions: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub customer_name: String,
    #[validate(length(min = 5, max = 15))]
    pub customer_phone: String,
}

/// Booking plus its service lines, returned by detail endpoints
#[derive(Debug, Serialize)]
pub struct BookingDetail {
    #[serde(flatten)]
    pub booking: Booking,
    pub services: Vec<ServiceLine>,
    /// Non-blocking advisories raised at creation, empty on plain reads
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Query parameters for listing bookings
#[derive(Debug, Deserialize)]
pub struct ListBookingsQuery {
    pub status: Option<BookingStatus>,
    pub page: Option<i32>,
    pub limit: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct DeclineRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub final_price: Option<Decimal>,
    pub completion_note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
    pub note: Option<String>,
}

/// Phase tag for uploaded booking images
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "image_phase", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ImagePhase {
    Before,
    During,
    After,
    Approval,
}

impl ImagePhase {
    /// Per-phase upload cap
    pub fn max_images(&self) -> i64 {
        match self {
            ImagePhase::Before | ImagePhase::After => 3,
            ImagePhase::During | ImagePhase::Approval => 5,
        }
    }
}

/// Image attached to a booking; the file itself lives in external storage,
/// the core only keeps the opaque URL
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct BookingImage {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub phase: ImagePhase,
    pub url: String,
    pub uploaded_by: Uuid,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddImagesRequest {
    pub phase: ImagePhase,
    #[validate(length(min = 1))]
    pub urls: Vec<String>,
    pub description: Option<String>,
}

/// Customer review for a completed booking
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Review {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub rating: i16,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub would_recommend: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateReviewRequest {
    #[validate(range(min = 1, max = 5))]
    pub rating: i16,
    #[validate(length(max = 200))]
    pub title: Option<String>,
    pub comment: Option<String>,
    #[serde(default = "default_true")]
    pub would_recommend: bool,
}

fn default_true() -> bool {
    true
}

/// Domain events emitted by the status machine. The machine itself never
/// sends anything; a dispatcher hands these to the notification collaborator.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type")]
pub enum BookingEvent {
    Created { booking_id: Uuid },
    Accepted { booking_id: Uuid },
    Declined { booking_id: Uuid },
    Scheduled { booking_id: Uuid },
    Started { booking_id: Uuid },
    Completed { booking_id: Uuid },
    Disputed { booking_id: Uuid, reason: String },
    Cancelled { booking_id: Uuid },
    Expired { booking_id: Uuid },
}
