//! Booking persistence and orchestration.
//!
//! All money-affecting transitions lock the row with `SELECT ... FOR
//! UPDATE`, run the status machine on the loaded snapshot, persist the
//! result and only then dispatch events. Overdue pending rows are expired
//! on read so callers never act on a booking the sweeper has not reached.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;
use validator::Validate;

use crate::config::BookingPolicy;
use crate::error::ApiError;
use crate::models::{Pagination, UserRole};
use crate::notify::Notifier;

use super::conflict::ConflictChecker;
use super::machine::{self, Transition, TransitionError};
use super::model::{
    Actor, AddImagesRequest, Booking, BookingDetail, BookingEvent, BookingImage, BookingStatus,
    CreateBookingRequest, CreateReviewRequest, ListBookingsQuery, Review, ServiceLine,
};

/// Outcome of one sweeper run
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub examined: u64,
    pub expired: u64,
    pub notify_failures: u64,
}

#[derive(Debug, Clone)]
pub struct BookingService {
    pool: PgPool,
    policy: BookingPolicy,
    checker: ConflictChecker,
    notifier: Notifier,
}

impl BookingService {
    pub fn new(pool: PgPool, policy: BookingPolicy, notifier: Notifier) -> Self {
        let checker = ConflictChecker::new(pool.clone(), policy.clone());
        Self {
            pool,
            policy,
            checker,
            notifier,
        }
    }

    pub fn checker(&self) -> &ConflictChecker {
        &self.checker
    }

    /// Create a pending booking with its service line snapshots.
    pub async fn create_booking(
        &self,
        customer: Actor,
        req: CreateBookingRequest,
    ) -> Result<BookingDetail, ApiError> {
        req.validate()?;
        if customer.role != UserRole::Customer {
            return Err(ApiError::Forbidden(
                "only customers can create bookings".to_string(),
            ));
        }
        if req.provider_id == customer.user_id {
            return Err(ApiError::BadRequest(
                "cannot book your own services".to_string(),
            ));
        }
        for line in &req.services {
            line.validate()?;
            if line.price < Decimal::ZERO {
                return Err(ApiError::BadRequest(
                    "service prices cannot be negative".to_string(),
                ));
            }
        }

        let now = Utc::now();
        self.checker
            .validate_creation_window(req.preferred_date, req.preferred_time, req.emergency, now)?;

        // A customer re-booking a provider they already have an open request
        // with is not a hard conflict; the response carries it as a warning.
        let mut warnings = Vec::new();
        if self
            .checker
            .has_pending_conflict(customer.user_id, req.provider_id)
            .await?
        {
            warnings.push("you already have an open booking with this provider".to_string());
        }

        let duration: i64 = req
            .services
            .iter()
            .map(|l| l.duration_minutes.unwrap_or(0) as i64)
            .sum::<i64>()
            .max(self.policy.default_service_duration_minutes);
        if self
            .checker
            .has_time_slot_conflict(
                req.provider_id,
                req.preferred_date,
                req.preferred_time,
                duration,
                None,
            )
            .await?
        {
            return Err(ApiError::Conflict(
                "the requested time overlaps another booking".to_string(),
            ));
        }

        let quoted_price: Decimal = req.services.iter().map(|l| l.price).sum();
        let deadline = now + chrono::Duration::hours(self.policy.provider_response_window_hours);
        // The provider cannot usefully confirm after the service time.
        let deadline = deadline.min(req.preferred_date.and_time(req.preferred_time).and_utc());

        let mut tx = self.pool.begin().await?;
        let booking: Booking = sqlx::query_as(
            r#"
            INSERT INTO bookings (
                customer_id, provider_id, status,
                preferred_date, preferred_time, confirmation_deadline, emergency,
                service_address, service_city, description, special_instructions,
                customer_name, customer_phone, quoted_price
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(customer.user_id)
        .bind(req.provider_id)
        .bind(req.preferred_date)
        .bind(req.preferred_time)
        .bind(deadline)
        .bind(req.emergency)
        .bind(&req.service_address)
        .bind(&req.service_city)
        .bind(&req.description)
        .bind(&req.special_instructions)
        .bind(&req.customer_name)
        .bind(&req.customer_phone)
        .bind(quoted_price)
        .fetch_one(&mut *tx)
        .await?;

        let mut services = Vec::with_capacity(req.services.len());
        for line in &req.services {
            let row: ServiceLine = sqlx::query_as(
                r#"
                INSERT INTO booking_services (booking_id, service_id, title, price, duration_minutes)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
            )
            .bind(booking.id)
            .bind(line.service_id)
            .bind(&line.title)
            .bind(line.price)
            .bind(line.duration_minutes)
            .fetch_one(&mut *tx)
            .await?;
            services.push(row);
        }
        tx.commit().await?;

        tracing::info!(
            booking_id = %booking.id,
            provider_id = %booking.provider_id,
            emergency = booking.emergency,
            "booking created"
        );
        self.notifier.dispatch(vec![BookingEvent::Created {
            booking_id: booking.id,
        }]);

        Ok(BookingDetail {
            booking,
            services,
            warnings,
        })
    }

    /// Fetch a booking the actor participates in, expiring it first if its
    /// confirmation deadline has lapsed.
    pub async fn get_booking(&self, id: Uuid, actor: Actor) -> Result<BookingDetail, ApiError> {
        self.expire_if_overdue(id).await?;

        let booking: Booking = sqlx::query_as("SELECT * FROM bookings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound("booking not found".to_string()))?;

        if !booking.is_participant(actor.user_id) {
            return Err(ApiError::Forbidden(
                "you are not a participant of this booking".to_string(),
            ));
        }

        let services = self.service_lines(id).await?;
        Ok(BookingDetail {
            booking,
            services,
            warnings: Vec::new(),
        })
    }

    /// List the actor's bookings, newest first. Overdue pending rows owned
    /// by the actor are expired before the page is read.
    pub async fn list_bookings(
        &self,
        actor: Actor,
        query: ListBookingsQuery,
    ) -> Result<Vec<Booking>, ApiError> {
        self.expire_overdue_for(actor.user_id).await?;

        let pagination = Pagination {
            page: query.page,
            limit: query.limit,
        };
        let (limit, offset) = pagination.limit_offset();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM bookings WHERE ");
        match actor.role {
            UserRole::Customer => qb.push("customer_id = "),
            UserRole::Provider => qb.push("provider_id = "),
        };
        qb.push_bind(actor.user_id);
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let bookings = qb.build_query_as::<Booking>().fetch_all(&self.pool).await?;
        Ok(bookings)
    }

    pub async fn accept(&self, id: Uuid, actor: Actor) -> Result<Booking, ApiError> {
        self.transition(id, Transition::Accept { actor }).await
    }

    pub async fn decline(
        &self,
        id: Uuid,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Booking, ApiError> {
        self.transition(id, Transition::Decline { actor, reason })
            .await
    }

    pub async fn schedule(
        &self,
        id: Uuid,
        actor: Actor,
        date: chrono::NaiveDate,
        time: chrono::NaiveTime,
    ) -> Result<Booking, ApiError> {
        let provider_id = self.load(id).await?.provider_id;
        let duration = self.checker.booking_duration_minutes(id).await?;
        let conflicting = self
            .checker
            .has_time_slot_conflict(provider_id, date, time, duration, Some(id))
            .await?;
        if conflicting {
            return Err(ApiError::Conflict(
                "the chosen slot overlaps another booking".to_string(),
            ));
        }
        self.transition(id, Transition::Schedule { actor, date, time })
            .await
    }

    pub async fn start(&self, id: Uuid, actor: Actor) -> Result<Booking, ApiError> {
        self.transition(id, Transition::Start { actor }).await
    }

    pub async fn complete(
        &self,
        id: Uuid,
        actor: Actor,
        final_price: Option<Decimal>,
        note: Option<String>,
    ) -> Result<Booking, ApiError> {
        self.transition(
            id,
            Transition::Complete {
                actor,
                final_price,
                note,
            },
        )
        .await
    }

    pub async fn dispute(
        &self,
        id: Uuid,
        actor: Actor,
        reason: String,
        note: Option<String>,
    ) -> Result<Booking, ApiError> {
        self.transition(
            id,
            Transition::Dispute {
                actor,
                reason,
                note,
            },
        )
        .await
    }

    pub async fn cancel(
        &self,
        id: Uuid,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Booking, ApiError> {
        self.transition(id, Transition::Cancel { actor, reason })
            .await
    }

    /// Expire a single pending booking whose deadline has lapsed. Safe to
    /// call on any booking; does nothing unless the expiry guard matches.
    pub async fn expire_if_overdue(&self, id: Uuid) -> Result<Option<Booking>, ApiError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let Some(mut booking) = self.lock_booking(&mut tx, id).await? else {
            return Ok(None);
        };
        if !booking.is_overdue(now) {
            return Ok(None);
        }
        let events = machine::apply(&mut booking, Transition::Expire, now)
            .map_err(ApiError::from)?;
        self.persist(&mut tx, &booking).await?;
        tx.commit().await?;

        tracing::info!(booking_id = %booking.id, "booking expired on read");
        self.notifier.dispatch(events);
        Ok(Some(booking))
    }

    /// Expire every overdue pending booking the user participates in.
    /// Runs before list reads so stale rows never reach the client.
    pub async fn expire_overdue_for(&self, user_id: Uuid) -> Result<u64, ApiError> {
        let now = Utc::now();
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE bookings
            SET status = 'expired', updated_at = $2
            WHERE (customer_id = $1 OR provider_id = $1)
              AND status = 'pending'
              AND confirmation_deadline <= $2
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if !ids.is_empty() {
            tracing::info!(user_id = %user_id, count = ids.len(), "expired overdue bookings on list");
            self.notifier.dispatch(
                ids.iter()
                    .map(|(id,)| BookingEvent::Expired { booking_id: *id })
                    .collect(),
            );
        }
        Ok(ids.len() as u64)
    }

    /// Batch expiry for the external sweeper. Each row is expired in its
    /// own transaction so one failure never poisons the batch, and
    /// notification failures are counted separately from expiries.
    pub async fn sweep_expired(&self, dry_run: bool) -> Result<SweepOutcome, ApiError> {
        let now = Utc::now();
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM bookings
            WHERE status = 'pending' AND confirmation_deadline <= $1
            ORDER BY confirmation_deadline
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut outcome = SweepOutcome {
            examined: ids.len() as u64,
            ..Default::default()
        };
        if dry_run {
            return Ok(outcome);
        }

        for (id,) in ids {
            let mut tx = self.pool.begin().await?;
            let Some(mut booking) = self.lock_booking(&mut tx, id).await? else {
                continue;
            };
            // The row may have been accepted or expired between the scan
            // and the lock.
            let events = match machine::apply(&mut booking, Transition::Expire, Utc::now()) {
                Ok(events) if !events.is_empty() => events,
                _ => continue,
            };
            self.persist(&mut tx, &booking).await?;
            tx.commit().await?;
            outcome.expired += 1;

            for event in &events {
                if !self.notifier.notify(event).await {
                    outcome.notify_failures += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Promote a booking to completed after a successful payment, unless it
    /// already reached a terminal status.
    pub async fn mark_paid_complete(&self, id: Uuid) -> Result<Booking, ApiError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut booking = self
            .lock_booking(&mut tx, id)
            .await?
            .ok_or_else(|| ApiError::NotFound("booking not found".to_string()))?;

        if booking.status.is_terminal() {
            return Ok(booking);
        }
        booking.status = BookingStatus::Completed;
        booking.completed_at = Some(now);
        booking.updated_at = now;
        if booking.final_price.is_none() {
            booking.final_price = booking.quoted_price;
        }
        self.persist(&mut tx, &booking).await?;
        tx.commit().await?;

        self.notifier.dispatch(vec![BookingEvent::Completed {
            booking_id: booking.id,
        }]);
        Ok(booking)
    }

    pub async fn add_images(
        &self,
        booking_id: Uuid,
        actor: Actor,
        req: AddImagesRequest,
    ) -> Result<Vec<BookingImage>, ApiError> {
        req.validate()?;
        let detail = self.get_booking(booking_id, actor).await?;
        if detail.booking.status.is_terminal() && detail.booking.status != BookingStatus::Completed
        {
            return Err(ApiError::BadRequest(
                "images cannot be added to a closed booking".to_string(),
            ));
        }

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM booking_images WHERE booking_id = $1 AND phase = $2",
        )
        .bind(booking_id)
        .bind(req.phase)
        .fetch_one(&self.pool)
        .await?;
        let cap = req.phase.max_images();
        if existing + req.urls.len() as i64 > cap {
            return Err(ApiError::BadRequest(format!(
                "at most {} images are allowed for this phase",
                cap
            )));
        }

        let mut tx = self.pool.begin().await?;
        let mut images = Vec::with_capacity(req.urls.len());
        for url in &req.urls {
            let image: BookingImage = sqlx::query_as(
                r#"
                INSERT INTO booking_images (booking_id, phase, url, uploaded_by, description)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
            )
            .bind(booking_id)
            .bind(req.phase)
            .bind(url)
            .bind(actor.user_id)
            .bind(&req.description)
            .fetch_one(&mut *tx)
            .await?;
            images.push(image);
        }
        tx.commit().await?;
        Ok(images)
    }

    pub async fn list_images(
        &self,
        booking_id: Uuid,
        actor: Actor,
    ) -> Result<Vec<BookingImage>, ApiError> {
        self.get_booking(booking_id, actor).await?;
        let images = sqlx::query_as(
            "SELECT * FROM booking_images WHERE booking_id = $1 ORDER BY created_at",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }

    /// One review per booking, by its customer, once the work is done.
    pub async fn create_review(
        &self,
        booking_id: Uuid,
        actor: Actor,
        req: CreateReviewRequest,
    ) -> Result<Review, ApiError> {
        req.validate()?;
        let detail = self.get_booking(booking_id, actor).await?;
        let booking = &detail.booking;
        if actor.user_id != booking.customer_id {
            return Err(ApiError::Forbidden(
                "only the customer can review a booking".to_string(),
            ));
        }
        if !matches!(
            booking.status,
            BookingStatus::Completed | BookingStatus::Disputed
        ) {
            return Err(ApiError::BadRequest(
                "only completed bookings can be reviewed".to_string(),
            ));
        }

        let review: Review = sqlx::query_as(
            r#"
            INSERT INTO reviews (booking_id, customer_id, provider_id, rating, title, comment, would_recommend)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .bind(booking.customer_id)
        .bind(booking.provider_id)
        .bind(req.rating)
        .bind(&req.title)
        .bind(&req.comment)
        .bind(req.would_recommend)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ApiError::Conflict("this booking has already been reviewed".to_string())
            }
            _ => ApiError::from(err),
        })?;
        Ok(review)
    }

    pub async fn get_review(
        &self,
        booking_id: Uuid,
        actor: Actor,
    ) -> Result<Review, ApiError> {
        self.get_booking(booking_id, actor).await?;
        sqlx::query_as("SELECT * FROM reviews WHERE booking_id = $1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound("no review for this booking".to_string()))
    }

    /// Load a booking by id without access checks, for internal callers.
    pub async fn load(&self, id: Uuid) -> Result<Booking, ApiError> {
        sqlx::query_as("SELECT * FROM bookings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound("booking not found".to_string()))
    }

    async fn service_lines(&self, booking_id: Uuid) -> Result<Vec<ServiceLine>, ApiError> {
        let lines = sqlx::query_as(
            "SELECT * FROM booking_services WHERE booking_id = $1 ORDER BY title",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lines)
    }

    /// Run a transition under a row lock. If the row turns out to be an
    /// overdue pending booking, it is expired first and the original
    /// transition is rejected with a deadline error.
    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Booking, ApiError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut booking = self
            .lock_booking(&mut tx, id)
            .await?
            .ok_or_else(|| ApiError::NotFound("booking not found".to_string()))?;

        if booking.is_overdue(now) {
            let events = machine::apply(&mut booking, Transition::Expire, now)
                .map_err(ApiError::from)?;
            self.persist(&mut tx, &booking).await?;
            tx.commit().await?;
            self.notifier.dispatch(events);
            return Err(ApiError::from(TransitionError::DeadlinePassed));
        }

        let events = machine::apply(&mut booking, transition, now).map_err(ApiError::from)?;
        self.persist(&mut tx, &booking).await?;
        tx.commit().await?;

        tracing::info!(booking_id = %booking.id, status = %booking.status, "booking transitioned");
        self.notifier.dispatch(events);
        Ok(booking)
    }

    async fn lock_booking(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Booking>, ApiError> {
        let booking = sqlx::query_as("SELECT * FROM bookings WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(booking)
    }

    async fn persist(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        booking: &Booking,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            UPDATE bookings SET
                status = $2,
                scheduled_date = $3,
                scheduled_time = $4,
                quoted_price = $5,
                final_price = $6,
                completion_note = $7,
                dispute_reason = $8,
                dispute_note = $9,
                cancelled_by = $10,
                cancellation_reason = $11,
                accepted_at = $12,
                provider_completed_at = $13,
                completed_at = $14,
                cancelled_at = $15,
                updated_at = $16
            WHERE id = $1
            "#,
        )
        .bind(booking.id)
        .bind(booking.status)
        .bind(booking.scheduled_date)
        .bind(booking.scheduled_time)
        .bind(booking.quoted_price)
        .bind(booking.final_price)
        .bind(&booking.completion_note)
        .bind(&booking.dispute_reason)
        .bind(&booking.dispute_note)
        .bind(booking.cancelled_by)
        .bind(&booking.cancellation_reason)
        .bind(booking.accepted_at)
        .bind(booking.provider_completed_at)
        .bind(booking.completed_at)
        .bind(booking.cancelled_at)
        .bind(booking.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
