//! Pure booking status machine.
//!
//! Every lifecycle change goes through [`apply`]: it checks the actor, the
//! current status and the temporal guards, mutates the booking in place and
//! returns the domain events the caller should dispatch. No I/O happens
//! here; persistence and notification are the service layer's job.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::UserRole;

use super::model::{Actor, Booking, BookingEvent, BookingStatus};

/// A requested lifecycle change
#[derive(Debug, Clone)]
pub enum Transition {
    Accept {
        actor: Actor,
    },
    Decline {
        actor: Actor,
        reason: Option<String>,
    },
    Schedule {
        actor: Actor,
        date: NaiveDate,
        time: NaiveTime,
    },
    Start {
        actor: Actor,
    },
    Complete {
        actor: Actor,
        final_price: Option<Decimal>,
        note: Option<String>,
    },
    Dispute {
        actor: Actor,
        reason: String,
        note: Option<String>,
    },
    Cancel {
        actor: Actor,
        reason: Option<String>,
    },
    /// System transition, no actor. A no-op unless the booking is pending
    /// and past its confirmation deadline.
    Expire,
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("only {required} can {action} a booking")]
    RoleMismatch {
        action: &'static str,
        required: &'static str,
    },
    #[error("user is not a participant of this booking")]
    NotParticipant,
    #[error("cannot {action} a booking in status '{current}' (requires {allowed})")]
    InvalidStatus {
        action: &'static str,
        allowed: &'static str,
        current: BookingStatus,
    },
    #[error("the confirmation deadline has passed; the booking has expired")]
    DeadlinePassed,
    #[error("the requested service time has already elapsed")]
    ServiceTimeElapsed,
    #[error("the scheduled date and time must be in the future")]
    ScheduledTimeInPast,
    #[error("a dispute reason is required")]
    EmptyDisputeReason,
    #[error("the final price cannot be negative")]
    NegativeFinalPrice,
}

/// Apply a transition at time `now`. On error the booking is untouched.
pub fn apply(
    booking: &mut Booking,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    match transition {
        Transition::Accept { actor } => accept(booking, actor, now),
        Transition::Decline { actor, reason } => decline(booking, actor, reason, now),
        Transition::Schedule { actor, date, time } => schedule(booking, actor, date, time, now),
        Transition::Start { actor } => start(booking, actor, now),
        Transition::Complete {
            actor,
            final_price,
            note,
        } => complete(booking, actor, final_price, note, now),
        Transition::Dispute {
            actor,
            reason,
            note,
        } => dispute(booking, actor, reason, note, now),
        Transition::Cancel { actor, reason } => cancel(booking, actor, reason, now),
        Transition::Expire => expire(booking, now),
    }
}

fn require_provider(
    booking: &Booking,
    actor: Actor,
    action: &'static str,
) -> Result<(), TransitionError> {
    if actor.role != UserRole::Provider {
        return Err(TransitionError::RoleMismatch {
            action,
            required: "the provider",
        });
    }
    if actor.user_id != booking.provider_id {
        return Err(TransitionError::NotParticipant);
    }
    Ok(())
}

fn require_customer(
    booking: &Booking,
    actor: Actor,
    action: &'static str,
) -> Result<(), TransitionError> {
    if actor.role != UserRole::Customer {
        return Err(TransitionError::RoleMismatch {
            action,
            required: "the customer",
        });
    }
    if actor.user_id != booking.customer_id {
        return Err(TransitionError::NotParticipant);
    }
    Ok(())
}

fn require_status(
    booking: &Booking,
    action: &'static str,
    allowed: &'static str,
    ok: bool,
) -> Result<(), TransitionError> {
    if ok {
        Ok(())
    } else {
        Err(TransitionError::InvalidStatus {
            action,
            allowed,
            current: booking.status,
        })
    }
}

fn touch(booking: &mut Booking, now: DateTime<Utc>) {
    booking.updated_at = now;
}

fn accept(
    booking: &mut Booking,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    require_provider(booking, actor, "accept")?;
    require_status(
        booking,
        "accept",
        "pending",
        booking.status == BookingStatus::Pending,
    )?;
    // Expiry wins the race: a late acceptance is rejected even if the
    // sweeper has not flipped the row yet.
    if now >= booking.confirmation_deadline {
        return Err(TransitionError::DeadlinePassed);
    }
    if now >= booking.preferred_datetime() {
        return Err(TransitionError::ServiceTimeElapsed);
    }

    booking.status = BookingStatus::Confirmed;
    booking.accepted_at = Some(now);
    touch(booking, now);
    Ok(vec![BookingEvent::Accepted {
        booking_id: booking.id,
    }])
}

fn decline(
    booking: &mut Booking,
    actor: Actor,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    require_provider(booking, actor, "decline")?;
    require_status(
        booking,
        "decline",
        "pending",
        booking.status == BookingStatus::Pending,
    )?;

    booking.status = BookingStatus::Declined;
    booking.cancellation_reason = reason;
    touch(booking, now);
    Ok(vec![BookingEvent::Declined {
        booking_id: booking.id,
    }])
}

fn schedule(
    booking: &mut Booking,
    actor: Actor,
    date: NaiveDate,
    time: NaiveTime,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    require_provider(booking, actor, "schedule")?;
    require_status(
        booking,
        "schedule",
        "pending or confirmed",
        matches!(
            booking.status,
            BookingStatus::Pending | BookingStatus::Confirmed
        ),
    )?;
    if date.and_time(time).and_utc() <= now {
        return Err(TransitionError::ScheduledTimeInPast);
    }

    let mut events = Vec::new();
    // Scheduling straight from pending is an implicit acceptance.
    if booking.status == BookingStatus::Pending {
        if now >= booking.confirmation_deadline {
            return Err(TransitionError::DeadlinePassed);
        }
        booking.accepted_at = Some(now);
        events.push(BookingEvent::Accepted {
            booking_id: booking.id,
        });
    }
    booking.status = BookingStatus::Scheduled;
    booking.scheduled_date = Some(date);
    booking.scheduled_time = Some(time);
    touch(booking, now);
    events.push(BookingEvent::Scheduled {
        booking_id: booking.id,
    });
    Ok(events)
}

fn start(
    booking: &mut Booking,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    require_provider(booking, actor, "start")?;
    require_status(
        booking,
        "start",
        "confirmed or scheduled",
        matches!(
            booking.status,
            BookingStatus::Confirmed | BookingStatus::Scheduled
        ),
    )?;

    booking.status = BookingStatus::InProgress;
    touch(booking, now);
    Ok(vec![BookingEvent::Started {
        booking_id: booking.id,
    }])
}

fn complete(
    booking: &mut Booking,
    actor: Actor,
    final_price: Option<Decimal>,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    require_provider(booking, actor, "complete")?;
    require_status(
        booking,
        "complete",
        "in_progress or scheduled",
        matches!(
            booking.status,
            BookingStatus::InProgress | BookingStatus::Scheduled
        ),
    )?;
    if final_price.is_some_and(|p| p < Decimal::ZERO) {
        return Err(TransitionError::NegativeFinalPrice);
    }

    booking.status = BookingStatus::Completed;
    booking.final_price = final_price.or(booking.quoted_price);
    booking.completion_note = note;
    booking.provider_completed_at = Some(now);
    booking.completed_at = Some(now);
    touch(booking, now);
    Ok(vec![BookingEvent::Completed {
        booking_id: booking.id,
    }])
}

fn dispute(
    booking: &mut Booking,
    actor: Actor,
    reason: String,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    require_customer(booking, actor, "dispute")?;
    require_status(
        booking,
        "dispute",
        "completed",
        booking.status == BookingStatus::Completed,
    )?;
    let reason = reason.trim().to_owned();
    if reason.is_empty() {
        return Err(TransitionError::EmptyDisputeReason);
    }

    booking.status = BookingStatus::Disputed;
    booking.dispute_reason = Some(reason.clone());
    booking.dispute_note = note;
    touch(booking, now);
    Ok(vec![BookingEvent::Disputed {
        booking_id: booking.id,
        reason,
    }])
}

fn cancel(
    booking: &mut Booking,
    actor: Actor,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    if !booking.is_participant(actor.user_id) {
        return Err(TransitionError::NotParticipant);
    }
    require_status(
        booking,
        "cancel",
        "pending, confirmed or scheduled",
        booking.is_cancellable(),
    )?;

    booking.status = BookingStatus::Cancelled;
    booking.cancelled_by = Some(actor.user_id);
    booking.cancellation_reason = reason;
    booking.cancelled_at = Some(now);
    touch(booking, now);
    Ok(vec![BookingEvent::Cancelled {
        booking_id: booking.id,
    }])
}

fn expire(
    booking: &mut Booking,
    now: DateTime<Utc>,
) -> Result<Vec<BookingEvent>, TransitionError> {
    if !booking.is_overdue(now) {
        // Already expired, or not yet due: nothing to do.
        return Ok(Vec::new());
    }

    booking.status = BookingStatus::Expired;
    touch(booking, now);
    Ok(vec![BookingEvent::Expired {
        booking_id: booking.id,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn booking(status: BookingStatus) -> Booking {
        let now = t0();
        Booking {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            status,
            preferred_date: NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            preferred_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            scheduled_date: None,
            scheduled_time: None,
            confirmation_deadline: now + Duration::hours(4),
            emergency: false,
            service_address: "12 Putalisadak".into(),
            service_city: "Kathmandu".into(),
            description: "Leaking kitchen sink".into(),
            special_instructions: None,
            customer_name: "Asha Rai".into(),
            customer_phone: "9800000001".into(),
            quoted_price: Some(Decimal::new(150000, 2)),
            final_price: None,
            completion_note: None,
            dispute_reason: None,
            dispute_note: None,
            cancelled_by: None,
            cancellation_reason: None,
            accepted_at: None,
            provider_completed_at: None,
            completed_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn provider(b: &Booking) -> Actor {
        Actor {
            user_id: b.provider_id,
            role: UserRole::Provider,
        }
    }

    fn customer(b: &Booking) -> Actor {
        Actor {
            user_id: b.customer_id,
            role: UserRole::Customer,
        }
    }

    #[test]
    fn accept_moves_pending_to_confirmed() {
        let mut b = booking(BookingStatus::Pending);
        let actor = provider(&b);
        let events = apply(&mut b, Transition::Accept { actor }, t0()).unwrap();
        assert_eq!(b.status, BookingStatus::Confirmed);
        assert_eq!(b.accepted_at, Some(t0()));
        assert!(matches!(events[0], BookingEvent::Accepted { .. }));
    }

    #[test]
    fn accept_after_deadline_is_rejected() {
        let mut b = booking(BookingStatus::Pending);
        let late = b.confirmation_deadline + Duration::seconds(1);
        let actor = provider(&b);
        let err = apply(&mut b, Transition::Accept { actor }, late).unwrap_err();
        assert_eq!(err, TransitionError::DeadlinePassed);
        assert_eq!(b.status, BookingStatus::Pending);
    }

    #[test]
    fn accept_at_exact_deadline_is_rejected() {
        let mut b = booking(BookingStatus::Pending);
        let at = b.confirmation_deadline;
        let actor = provider(&b);
        let err = apply(&mut b, Transition::Accept { actor }, at).unwrap_err();
        assert_eq!(err, TransitionError::DeadlinePassed);
    }

    #[test]
    fn accept_requires_the_provider() {
        let mut b = booking(BookingStatus::Pending);
        let actor = customer(&b);
        let err = apply(&mut b, Transition::Accept { actor }, t0()).unwrap_err();
        assert!(matches!(err, TransitionError::RoleMismatch { .. }));

        let stranger = Actor {
            user_id: Uuid::new_v4(),
            role: UserRole::Provider,
        };
        let err = apply(&mut b, Transition::Accept { actor: stranger }, t0()).unwrap_err();
        assert_eq!(err, TransitionError::NotParticipant);
    }

    #[test]
    fn accept_after_service_time_is_rejected() {
        let mut b = booking(BookingStatus::Pending);
        b.confirmation_deadline = t0() + Duration::days(10);
        let after_service = b.preferred_datetime() + Duration::minutes(1);
        let actor = provider(&b);
        let err = apply(&mut b, Transition::Accept { actor }, after_service)
        .unwrap_err();
        assert_eq!(err, TransitionError::ServiceTimeElapsed);
    }

    #[test]
    fn decline_records_reason() {
        let mut b = booking(BookingStatus::Pending);
        let actor = provider(&b);
        apply(
            &mut b,
            Transition::Decline {
                actor,
                reason: Some("fully booked".into()),
            },
            t0(),
        )
        .unwrap();
        assert_eq!(b.status, BookingStatus::Declined);
        assert_eq!(b.cancellation_reason.as_deref(), Some("fully booked"));
    }

    #[test]
    fn schedule_from_pending_implies_acceptance() {
        let mut b = booking(BookingStatus::Pending);
        let actor = provider(&b);
        let events = apply(
            &mut b,
            Transition::Schedule {
                actor,
                date: NaiveDate::from_ymd_opt(2025, 6, 4).unwrap(),
                time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            },
            t0(),
        )
        .unwrap();
        assert_eq!(b.status, BookingStatus::Scheduled);
        assert!(b.accepted_at.is_some());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BookingEvent::Accepted { .. }));
        assert!(matches!(events[1], BookingEvent::Scheduled { .. }));
    }

    #[test]
    fn schedule_rejects_past_times() {
        let mut b = booking(BookingStatus::Confirmed);
        let actor = provider(&b);
        let err = apply(
            &mut b,
            Transition::Schedule {
                actor,
                date: NaiveDate::from_ymd_opt(2025, 5, 31).unwrap(),
                time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            },
            t0(),
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::ScheduledTimeInPast);
    }

    #[test]
    fn start_allowed_from_confirmed_and_scheduled() {
        for status in [BookingStatus::Confirmed, BookingStatus::Scheduled] {
            let mut b = booking(status);
            let actor = provider(&b);
            apply(&mut b, Transition::Start { actor }, t0()).unwrap();
            assert_eq!(b.status, BookingStatus::InProgress);
        }
    }

    #[test]
    fn complete_defaults_final_price_to_quote() {
        let mut b = booking(BookingStatus::InProgress);
        let actor = provider(&b);
        apply(
            &mut b,
            Transition::Complete {
                actor,
                final_price: None,
                note: Some("replaced the trap".into()),
            },
            t0(),
        )
        .unwrap();
        assert_eq!(b.status, BookingStatus::Completed);
        assert_eq!(b.final_price, b.quoted_price);
        assert_eq!(b.completed_at, Some(t0()));
    }

    #[test]
    fn complete_keeps_explicit_final_price() {
        let mut b = booking(BookingStatus::InProgress);
        let price = Decimal::new(175050, 2);
        let actor = provider(&b);
        apply(
            &mut b,
            Transition::Complete {
                actor,
                final_price: Some(price),
                note: None,
            },
            t0(),
        )
        .unwrap();
        assert_eq!(b.final_price, Some(price));
    }

    #[test]
    fn complete_rejects_negative_final_price() {
        let mut b = booking(BookingStatus::InProgress);
        let actor = provider(&b);
        let err = apply(
            &mut b,
            Transition::Complete {
                actor,
                final_price: Some(Decimal::new(-5000, 2)),
                note: None,
            },
            t0(),
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::NegativeFinalPrice);
        assert_eq!(b.status, BookingStatus::InProgress);
        assert_eq!(b.final_price, None);
    }

    #[test]
    fn dispute_requires_completed_and_a_reason() {
        let mut b = booking(BookingStatus::Completed);
        let actor = customer(&b);
        let err = apply(
            &mut b,
            Transition::Dispute {
                actor,
                reason: "   ".into(),
                note: None,
            },
            t0(),
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::EmptyDisputeReason);

        let actor = customer(&b);
        apply(
            &mut b,
            Transition::Dispute {
                actor,
                reason: "work left unfinished".into(),
                note: Some("photos attached".into()),
            },
            t0(),
        )
        .unwrap();
        assert_eq!(b.status, BookingStatus::Disputed);
        assert_eq!(b.dispute_reason.as_deref(), Some("work left unfinished"));
    }

    #[test]
    fn dispute_rejected_for_in_progress() {
        let mut b = booking(BookingStatus::InProgress);
        let actor = customer(&b);
        let err = apply(
            &mut b,
            Transition::Dispute {
                actor,
                reason: "too slow".into(),
                note: None,
            },
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidStatus { .. }));
    }

    #[test]
    fn either_party_can_cancel_before_work_starts() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Scheduled,
        ] {
            let mut b = booking(status);
            let actor = customer(&b);
            apply(
                &mut b,
                Transition::Cancel {
                    actor,
                    reason: Some("found someone closer".into()),
                },
                t0(),
            )
            .unwrap();
            assert_eq!(b.status, BookingStatus::Cancelled);
            assert_eq!(b.cancelled_by, Some(b.customer_id));
        }
    }

    #[test]
    fn cancel_rejected_once_in_progress() {
        let mut b = booking(BookingStatus::InProgress);
        let actor = provider(&b);
        let err = apply(
            &mut b,
            Transition::Cancel {
                actor,
                reason: None,
            },
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidStatus { .. }));
    }

    #[test]
    fn expire_flips_overdue_pending_only() {
        let mut b = booking(BookingStatus::Pending);
        let late = b.confirmation_deadline + Duration::minutes(5);
        let events = apply(&mut b, Transition::Expire, late).unwrap();
        assert_eq!(b.status, BookingStatus::Expired);
        assert_eq!(events.len(), 1);

        // Idempotent: a second pass emits nothing.
        let events = apply(&mut b, Transition::Expire, late).unwrap();
        assert!(events.is_empty());

        // Not yet due: no-op.
        let mut fresh = booking(BookingStatus::Pending);
        let events = apply(&mut fresh, Transition::Expire, t0()).unwrap();
        assert!(events.is_empty());
        assert_eq!(fresh.status, BookingStatus::Pending);
    }

    #[test]
    fn terminal_statuses_reject_lifecycle_actions() {
        for status in [
            BookingStatus::Cancelled,
            BookingStatus::Declined,
            BookingStatus::Expired,
            BookingStatus::Disputed,
        ] {
            let mut b = booking(status);
            let prov = provider(&b);
            let cust = customer(&b);
            assert!(apply(&mut b, Transition::Accept { actor: prov }, t0()).is_err());
            assert!(apply(&mut b, Transition::Start { actor: prov }, t0()).is_err());
            assert!(apply(
                &mut b,
                Transition::Cancel {
                    actor: cust,
                    reason: None
                },
                t0()
            )
            .is_err());
        }
    }
}
