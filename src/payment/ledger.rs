//! Payment ledger: the single authoritative payment row per booking.
//!
//! Rows are created lazily on first settlement activity and updated
//! idempotently. The fee split is always recomputed from the amount being
//! settled, never accumulated.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::booking::Booking;
use crate::error::ApiError;

use super::model::{Payment, PaymentMethod, PaymentStatus};

/// Fee split for one settled amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentSplit {
    pub platform_fee: Decimal,
    pub provider_amount: Decimal,
}

/// Split an amount into the platform's cut and the provider's payout.
/// The fee is rounded half-up to 2 decimal places; the provider gets the
/// exact remainder so the two parts always sum to the amount.
pub fn compute_split(amount: Decimal, fee_percentage: Decimal) -> PaymentSplit {
    let platform_fee = (amount * fee_percentage / Decimal::from(100))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    PaymentSplit {
        platform_fee,
        provider_amount: amount - platform_fee,
    }
}

#[derive(Debug, Clone)]
pub struct PaymentLedger {
    pool: PgPool,
    fee_percentage: Decimal,
}

impl PaymentLedger {
    pub fn new(pool: PgPool, fee_percentage: Decimal) -> Self {
        Self {
            pool,
            fee_percentage,
        }
    }

    pub fn fee_percentage(&self) -> Decimal {
        self.fee_percentage
    }

    /// The amount owed for a booking: the final price once set, otherwise
    /// the quote.
    pub fn amount_due(booking: &Booking) -> Result<Decimal, ApiError> {
        booking
            .final_price
            .or(booking.quoted_price)
            .ok_or_else(|| ApiError::BadRequest("the booking has no payable amount".to_string()))
    }

    pub async fn get_for_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, ApiError> {
        let payment = sqlx::query_as("SELECT * FROM payments WHERE booking_id = $1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    /// Fetch the booking's payment row, creating a pending one if none
    /// exists yet. Concurrent callers race on the unique booking_id; the
    /// loser reads the winner's row.
    pub async fn get_or_create(
        &self,
        booking: &Booking,
        method: PaymentMethod,
    ) -> Result<Payment, ApiError> {
        let amount = Self::amount_due(booking)?;
        sqlx::query(
            r#"
            INSERT INTO payments (
                booking_id, customer_id, provider_id, amount,
                platform_fee_percentage, payment_method
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (booking_id) DO NOTHING
            "#,
        )
        .bind(booking.id)
        .bind(booking.customer_id)
        .bind(booking.provider_id)
        .bind(amount)
        .bind(self.fee_percentage)
        .bind(method)
        .execute(&self.pool)
        .await?;

        sqlx::query_as("SELECT * FROM payments WHERE booking_id = $1")
            .bind(booking.id)
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::from)
    }

    /// Mark the booking's payment settled. Idempotent: a payment already
    /// completed is returned untouched, so replayed gateway callbacks and
    /// double confirmations cannot settle twice.
    pub async fn settle(
        &self,
        booking: &Booking,
        method: PaymentMethod,
        amount: Decimal,
        transaction_ref: Option<&str>,
        reference_number: Option<&str>,
        gateway_response: Option<&serde_json::Value>,
        note: Option<&str>,
    ) -> Result<Payment, ApiError> {
        self.get_or_create(booking, method).await?;

        let mut tx = self.pool.begin().await?;
        let payment = self
            .settle_in(
                &mut tx,
                booking,
                method,
                amount,
                transaction_ref,
                reference_number,
                gateway_response,
                note,
            )
            .await?;
        tx.commit().await?;
        Ok(payment)
    }

    /// Settlement step inside a caller-owned transaction, so the caller can
    /// commit it together with its own writes. The payment row must already
    /// exist (see [`Self::get_or_create`]).
    #[allow(clippy::too_many_arguments)]
    pub async fn settle_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        booking: &Booking,
        method: PaymentMethod,
        amount: Decimal,
        transaction_ref: Option<&str>,
        reference_number: Option<&str>,
        gateway_response: Option<&serde_json::Value>,
        note: Option<&str>,
    ) -> Result<Payment, ApiError> {
        let payment = self.lock_for_booking(tx, booking.id).await?;
        if payment.status == PaymentStatus::Completed {
            tracing::debug!(booking_id = %booking.id, "payment already settled, skipping");
            return Ok(payment);
        }

        let split = compute_split(amount, self.fee_percentage);
        let now = Utc::now();
        let payment: Payment = sqlx::query_as(
            r#"
            UPDATE payments SET
                amount = $2,
                platform_fee = $3,
                provider_amount = $4,
                payment_method = $5,
                status = 'completed',
                transaction_id = COALESCE($6, transaction_id),
                reference_number = COALESCE($7, reference_number),
                gateway_response = COALESCE($8, gateway_response),
                notes = COALESCE($9, notes),
                paid_at = $10,
                updated_at = $10
            WHERE booking_id = $1
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .bind(amount)
        .bind(split.platform_fee)
        .bind(split.provider_amount)
        .bind(method)
        .bind(transaction_ref)
        .bind(reference_number)
        .bind(gateway_response)
        .bind(note)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            booking_id = %booking.id,
            method = %method,
            amount = %amount,
            platform_fee = %split.platform_fee,
            "payment settled"
        );
        Ok(payment)
    }

    /// Settle any outstanding payment when a booking completes. No payment
    /// row means the customer never initiated a payment, and completion does
    /// not invent one. A payment already completed, refunded or cancelled is
    /// frozen; anything else is marked completed at the amount now due.
    pub async fn settle_on_completion(&self, booking: &Booking) -> Result<Option<Payment>, ApiError> {
        if self.get_for_booking(booking.id).await?.is_none() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;
        let existing = self.lock_for_booking(&mut tx, booking.id).await?;
        if matches!(
            existing.status,
            PaymentStatus::Completed | PaymentStatus::Refunded | PaymentStatus::Cancelled
        ) {
            return Ok(Some(existing));
        }

        let amount = Self::amount_due(booking)?;
        let split = compute_split(amount, existing.platform_fee_percentage);
        let now = Utc::now();
        let payment: Payment = sqlx::query_as(
            r#"
            UPDATE payments SET
                amount = $2,
                platform_fee = $3,
                provider_amount = $4,
                status = 'completed',
                paid_at = $5,
                updated_at = $5
            WHERE booking_id = $1
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .bind(amount)
        .bind(split.platform_fee)
        .bind(split.provider_amount)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(booking_id = %booking.id, amount = %amount, "payment settled on completion");
        Ok(Some(payment))
    }

    /// Record a gateway-reported refund on the payment row.
    pub async fn mark_refunded(&self, booking_id: Uuid) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            UPDATE payments SET
                status = 'refunded',
                refunded_at = NOW(),
                updated_at = NOW()
            WHERE booking_id = $1
            "#,
        )
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        tracing::info!(booking_id = %booking_id, "payment marked refunded");
        Ok(())
    }

    /// Annotate the payment when its booking is disputed. Settled funds are
    /// not clawed back; the note flags the row for manual resolution.
    pub async fn hold_on_dispute(&self, booking_id: Uuid, reason: &str) -> Result<(), ApiError> {
        let note = format!("on hold: disputed ({})", reason);
        let updated = sqlx::query(
            r#"
            UPDATE payments SET
                notes = CASE WHEN notes IS NULL THEN $2 ELSE notes || E'\n' || $2 END,
                updated_at = NOW()
            WHERE booking_id = $1
            "#,
        )
        .bind(booking_id)
        .bind(&note)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            tracing::warn!(booking_id = %booking_id, "payment flagged for dispute review");
        }
        Ok(())
    }

    async fn lock_for_booking(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        booking_id: Uuid,
    ) -> Result<Payment, ApiError> {
        sqlx::query_as("SELECT * FROM payments WHERE booking_id = $1 FOR UPDATE")
            .bind(booking_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(ApiError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn split_takes_the_percentage_fee() {
        let split = compute_split(dec("1000.00"), dec("10.00"));
        assert_eq!(split.platform_fee, dec("100.00"));
        assert_eq!(split.provider_amount, dec("900.00"));
    }

    #[test]
    fn split_rounds_half_up() {
        // 10% of 100.05 is 10.005, which rounds up to 10.01.
        let split = compute_split(dec("100.05"), dec("10.00"));
        assert_eq!(split.platform_fee, dec("10.01"));
        assert_eq!(split.provider_amount, dec("90.04"));
    }

    #[test]
    fn split_parts_always_sum_to_the_amount() {
        for amount in ["0.01", "99.99", "123.45", "100.05", "1500.00"] {
            let amount = dec(amount);
            let split = compute_split(amount, dec("10.00"));
            assert_eq!(split.platform_fee + split.provider_amount, amount);
        }
    }

    #[test]
    fn zero_fee_gives_everything_to_the_provider() {
        let split = compute_split(dec("250.00"), Decimal::ZERO);
        assert_eq!(split.platform_fee, Decimal::ZERO);
        assert_eq!(split.provider_amount, dec("250.00"));
    }
}
