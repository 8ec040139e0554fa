//! Conflict detection and slot availability.
//!
//! Providers cannot hold two bookings in overlapping windows. A window is
//! the requested start time plus the summed duration of the booked service
//! lines, padded with the configured buffer on both sides.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::BookingPolicy;
use crate::error::ApiError;

/// Default provider working hours used when no availability row exists
const DEFAULT_WORK_START: (u32, u32) = (8, 0);
const DEFAULT_WORK_END: (u32, u32) = (18, 0);

#[derive(Debug, Clone)]
pub struct ConflictChecker {
    pool: PgPool,
    policy: BookingPolicy,
}

/// A provider's working hours for slot generation
#[derive(Debug, Clone, Copy)]
struct WorkingHours {
    start: NaiveTime,
    end: NaiveTime,
    buffer_minutes: i64,
}

/// An occupied window on a provider's calendar
#[derive(Debug, sqlx::FromRow)]
struct BusyRow {
    start_time: NaiveTime,
    duration_minutes: i64,
}

/// Pre-flight validation for a prospective booking. Conflicts block
/// creation; warnings do not (another customer's unanswered request at the
/// same time is the provider's choice to resolve).
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub conflicts: Vec<String>,
    pub warnings: Vec<String>,
    pub alternative_times: Vec<NaiveTime>,
    pub alternative_dates: Vec<NaiveDate>,
}

impl ConflictChecker {
    pub fn new(pool: PgPool, policy: BookingPolicy) -> Self {
        Self { pool, policy }
    }

    /// Rejects requests outside the bookable window: too far in the future,
    /// or with too little lead time for the provider to react.
    pub fn validate_creation_window(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        emergency: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let requested = date.and_time(time).and_utc();
        let max_ahead = now + Duration::days(self.policy.max_advance_booking_days);
        if requested > max_ahead {
            return Err(ApiError::BadRequest(format!(
                "bookings can be made at most {} days in advance",
                self.policy.max_advance_booking_days
            )));
        }
        let min_lead = if emergency {
            self.policy.min_lead_emergency_minutes
        } else {
            self.policy.min_lead_minutes
        };
        if requested < now + Duration::minutes(min_lead) {
            return Err(ApiError::BadRequest(format!(
                "bookings need at least {} minutes of lead time",
                min_lead
            )));
        }
        Ok(())
    }

    /// True when this customer already holds an open booking with the
    /// provider, regardless of time. Open means pending, confirmed or
    /// scheduled. Non-blocking: creation surfaces it as a warning, never
    /// a failure.
    pub async fn has_pending_conflict(
        &self,
        customer_id: Uuid,
        provider_id: Uuid,
    ) -> Result<bool, ApiError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM bookings
            WHERE customer_id = $1
              AND provider_id = $2
              AND status = ANY(ARRAY['pending', 'confirmed', 'scheduled']::booking_status[])
            "#,
        )
        .bind(customer_id)
        .bind(provider_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// True when the proposed window overlaps another active booking's
    /// window on the provider's calendar. `exclude` skips the booking being
    /// rescheduled so it cannot conflict with itself.
    pub async fn has_time_slot_conflict(
        &self,
        provider_id: Uuid,
        date: NaiveDate,
        time: NaiveTime,
        duration_minutes: i64,
        exclude: Option<Uuid>,
    ) -> Result<bool, ApiError> {
        let busy = self.busy_windows(provider_id, date, exclude).await?;
        let buffer = self.policy.slot_buffer_minutes;
        Ok(busy.iter().any(|b| {
            windows_overlap(
                time,
                duration_minutes,
                b.start_time,
                b.duration_minutes,
                buffer,
            )
        }))
    }

    /// Free start times on the provider's calendar for the given day.
    /// Slots that have already started are dropped when the day is today.
    pub async fn available_slots(
        &self,
        provider_id: Uuid,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<NaiveTime>, ApiError> {
        let hours = self.working_hours(provider_id).await?;
        let busy = self.busy_windows(provider_id, date, None).await?;
        let busy: Vec<(NaiveTime, i64)> = busy
            .into_iter()
            .map(|b| (b.start_time, b.duration_minutes))
            .collect();

        let mut slots = free_slots(
            hours.start,
            hours.end,
            self.policy.default_slot_minutes,
            hours.buffer_minutes,
            &busy,
        );
        if date == now.date_naive() {
            let cutoff = now.time();
            slots.retain(|slot| *slot > cutoff);
        }
        Ok(slots)
    }

    /// The next calendar dates (within the advance-booking window) that
    /// still have at least one free slot. Offered when a requested slot
    /// turns out to conflict.
    pub async fn alternative_dates(
        &self,
        provider_id: Uuid,
        from: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<NaiveDate>, ApiError> {
        let mut dates = Vec::new();
        for offset in 1..=self.policy.max_advance_booking_days {
            let candidate = from + Duration::days(offset);
            if !self
                .available_slots(provider_id, candidate, now)
                .await?
                .is_empty()
            {
                dates.push(candidate);
            }
        }
        Ok(dates)
    }

    /// Pre-flight check a prospective booking without creating anything.
    /// When the request would be rejected, alternatives are suggested.
    pub async fn validate_request(
        &self,
        customer_id: Uuid,
        provider_id: Uuid,
        date: NaiveDate,
        time: NaiveTime,
        duration_minutes: Option<i64>,
        emergency: bool,
        now: DateTime<Utc>,
    ) -> Result<ValidationReport, ApiError> {
        let duration_minutes =
            duration_minutes.unwrap_or(self.policy.default_service_duration_minutes);
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();

        if let Err(err) = self.validate_creation_window(date, time, emergency, now) {
            conflicts.push(err.to_string());
        }
        if self
            .has_time_slot_conflict(provider_id, date, time, duration_minutes, None)
            .await?
        {
            conflicts.push("the requested time overlaps another booking".to_string());
        }
        if self.has_pending_conflict(customer_id, provider_id).await? {
            warnings.push("you already have an open booking with this provider".to_string());
        }

        let (alternative_times, alternative_dates) = if conflicts.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let times = self.available_slots(provider_id, date, now).await?;
            let dates = if times.is_empty() {
                self.alternative_dates(provider_id, date, now).await?
            } else {
                Vec::new()
            };
            (times, dates)
        };

        Ok(ValidationReport {
            valid: conflicts.is_empty(),
            conflicts,
            warnings,
            alternative_times,
            alternative_dates,
        })
    }

    /// Total window length for a booking: the sum of its service line
    /// durations, falling back to the configured default.
    pub async fn booking_duration_minutes(&self, booking_id: Uuid) -> Result<i64, ApiError> {
        let total: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(duration_minutes)::BIGINT FROM booking_services WHERE booking_id = $1",
        )
        .bind(booking_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(self.policy.default_service_duration_minutes))
    }

    async fn working_hours(&self, provider_id: Uuid) -> Result<WorkingHours, ApiError> {
        let row: Option<(NaiveTime, NaiveTime, i32)> = sqlx::query_as(
            "SELECT work_start, work_end, buffer_minutes FROM provider_availability WHERE provider_id = $1",
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((start, end, buffer)) => WorkingHours {
                start,
                end,
                buffer_minutes: buffer as i64,
            },
            None => WorkingHours {
                start: NaiveTime::from_hms_opt(DEFAULT_WORK_START.0, DEFAULT_WORK_START.1, 0)
                    .unwrap_or_default(),
                end: NaiveTime::from_hms_opt(DEFAULT_WORK_END.0, DEFAULT_WORK_END.1, 0)
                    .unwrap_or_default(),
                buffer_minutes: self.policy.slot_buffer_minutes,
            },
        })
    }

    async fn busy_windows(
        &self,
        provider_id: Uuid,
        date: NaiveDate,
        exclude: Option<Uuid>,
    ) -> Result<Vec<BusyRow>, ApiError> {
        let rows: Vec<BusyRow> = sqlx::query_as(
            r#"
            SELECT COALESCE(b.scheduled_time, b.preferred_time) AS start_time,
                   COALESCE(SUM(s.duration_minutes), $4)::BIGINT AS duration_minutes
            FROM bookings b
            LEFT JOIN booking_services s ON s.booking_id = b.id
            WHERE b.provider_id = $1
              AND COALESCE(b.scheduled_date, b.preferred_date) = $2
              AND b.status = ANY(ARRAY['confirmed', 'scheduled', 'in_progress']::booking_status[])
              AND ($3::UUID IS NULL OR b.id <> $3)
            GROUP BY b.id, start_time
            "#,
        )
        .bind(provider_id)
        .bind(date)
        .bind(exclude)
        .bind(self.policy.default_service_duration_minutes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Two windows collide when they overlap after padding the existing one
/// with the buffer on both sides.
fn windows_overlap(
    candidate_start: NaiveTime,
    candidate_minutes: i64,
    busy_start: NaiveTime,
    busy_minutes: i64,
    buffer_minutes: i64,
) -> bool {
    let day_start = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default();
    let cand_a = day_start.and_time(candidate_start);
    let cand_b = cand_a + Duration::minutes(candidate_minutes);
    let busy_a = day_start.and_time(busy_start) - Duration::minutes(buffer_minutes);
    let busy_b =
        day_start.and_time(busy_start) + Duration::minutes(busy_minutes + buffer_minutes);
    cand_a < busy_b && busy_a < cand_b
}

/// Generate free slot start times between `start` and `end`, skipping any
/// slot whose window would collide with a busy window.
fn free_slots(
    start: NaiveTime,
    end: NaiveTime,
    slot_minutes: i64,
    buffer_minutes: i64,
    busy: &[(NaiveTime, i64)],
) -> Vec<NaiveTime> {
    let day = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default();
    let mut slots = Vec::new();
    let mut cursor = day.and_time(start);
    let close = day.and_time(end);
    while cursor + Duration::minutes(slot_minutes) <= close {
        let slot = cursor.time();
        let taken = busy
            .iter()
            .any(|(bs, bm)| windows_overlap(slot, slot_minutes, *bs, *bm, buffer_minutes));
        if !taken {
            slots.push(slot);
        }
        cursor += Duration::minutes(slot_minutes);
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn overlapping_windows_detected() {
        // Busy 10:00-11:00 with a 15 minute buffer blocks 09:00-10:00
        // candidates that run past 09:45.
        assert!(windows_overlap(t(10, 30), 60, t(10, 0), 60, 15));
        assert!(windows_overlap(t(9, 0), 60, t(10, 0), 60, 15));
        assert!(!windows_overlap(t(8, 0), 60, t(10, 0), 60, 15));
        assert!(!windows_overlap(t(11, 30), 60, t(10, 0), 60, 15));
    }

    #[test]
    fn buffer_extends_the_busy_window() {
        // Exactly adjacent windows collide only because of the buffer.
        assert!(windows_overlap(t(11, 0), 60, t(10, 0), 60, 15));
        assert!(!windows_overlap(t(11, 0), 60, t(10, 0), 60, 0));
    }

    #[test]
    fn free_slots_cover_the_working_day() {
        let slots = free_slots(t(8, 0), t(18, 0), 60, 15, &[]);
        assert_eq!(slots.len(), 10);
        assert_eq!(slots[0], t(8, 0));
        assert_eq!(slots[9], t(17, 0));
    }

    #[test]
    fn busy_windows_remove_slots() {
        let busy = vec![(t(10, 0), 60)];
        let slots = free_slots(t(8, 0), t(18, 0), 60, 15, &busy);
        assert!(!slots.contains(&t(10, 0)));
        // Buffer spills into the neighbouring hours.
        assert!(!slots.contains(&t(9, 0)));
        assert!(!slots.contains(&t(11, 0)));
        assert!(slots.contains(&t(8, 0)));
        assert!(slots.contains(&t(12, 0)));
    }

    #[test]
    fn long_jobs_block_multiple_slots() {
        let busy = vec![(t(9, 0), 180)];
        let slots = free_slots(t(8, 0), t(18, 0), 60, 0, &busy);
        assert!(!slots.contains(&t(9, 0)));
        assert!(!slots.contains(&t(10, 0)));
        assert!(!slots.contains(&t(11, 0)));
        assert!(slots.contains(&t(8, 0)));
        assert!(slots.contains(&t(12, 0)));
    }

    #[test]
    fn no_slot_past_closing_time() {
        let slots = free_slots(t(17, 30), t(18, 0), 60, 0, &[]);
        assert!(slots.is_empty());
    }
}
