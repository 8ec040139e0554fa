//! Payment reconciliation.
//!
//! Orchestrates the gateway clients against the ledger. Gateway HTTP calls
//! always happen outside database transactions; the ledger write that
//! follows a successful verification is idempotent, so replayed callbacks
//! are harmless. A definitive gateway failure is always recorded as failed,
//! never left looking pending.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::booking::{Actor, Booking, BookingService, BookingStatus};
use crate::error::ApiError;
use crate::models::{Pagination, UserRole};

use super::gateway::{
    to_paisa, EsewaGateway, GatewayError, GatewayOutcome, KhaltiGateway,
};
use super::ledger::PaymentLedger;
use super::model::{
    ConfirmCashRequest, GatewayTransaction, InitiatePaymentRequest, Payment, PaymentInitiation,
    PaymentMethod, PaymentStatus, TransactionStatus, VerificationResult,
};

#[derive(Debug, Clone)]
pub struct PaymentService {
    pool: PgPool,
    bookings: BookingService,
    ledger: PaymentLedger,
    khalti: KhaltiGateway,
    esewa: EsewaGateway,
}

impl PaymentService {
    pub fn new(
        pool: PgPool,
        bookings: BookingService,
        ledger: PaymentLedger,
        khalti: KhaltiGateway,
        esewa: EsewaGateway,
    ) -> Self {
        Self {
            pool,
            bookings,
            ledger,
            khalti,
            esewa,
        }
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    /// Start a payment for a booking. Only the booking's customer can pay,
    /// and a booking that is already settled cannot be paid again.
    pub async fn initiate(
        &self,
        actor: Actor,
        req: InitiatePaymentRequest,
    ) -> Result<PaymentInitiation, ApiError> {
        let booking = self.bookings.get_booking(req.booking_id, actor).await?.booking;
        if actor.user_id != booking.customer_id {
            return Err(ApiError::Forbidden(
                "only the customer can pay for a booking".to_string(),
            ));
        }
        if booking.status.is_terminal() && booking.status != BookingStatus::Completed {
            return Err(ApiError::GuardViolation(format!(
                "cannot pay for a booking in status '{}'",
                booking.status
            )));
        }
        if let Some(payment) = self.ledger.get_for_booking(booking.id).await? {
            if payment.status == PaymentStatus::Completed {
                return Err(ApiError::Conflict(
                    "this booking is already paid".to_string(),
                ));
            }
        }

        let amount = PaymentLedger::amount_due(&booking)?;
        let txn = self
            .insert_transaction(&booking, req.payment_method, amount, &req)
            .await?;

        match req.payment_method {
            PaymentMethod::Cash => {
                self.ledger.get_or_create(&booking, PaymentMethod::Cash).await?;
                tracing::info!(booking_id = %booking.id, txn_id = %txn.id, "cash payment recorded");
                Ok(PaymentInitiation::Recorded {
                    transaction_id: txn.id,
                })
            }
            PaymentMethod::Khalti => {
                let return_url = req.return_url.as_deref().ok_or_else(|| {
                    ApiError::BadRequest("return_url is required for khalti".to_string())
                })?;
                let initiated = match self
                    .khalti
                    .initiate(
                        txn.id,
                        amount,
                        &format!("Booking {}", booking.id),
                        return_url,
                        return_url,
                    )
                    .await
                {
                    Ok(resp) => resp,
                    Err(err) => {
                        self.mark_transaction_failed(txn.id, &err.to_string(), None)
                            .await?;
                        return Err(ApiError::from(err));
                    }
                };

                sqlx::query(
                    r#"
                    UPDATE transactions SET
                        status = 'processing',
                        gateway_payment_id = $2,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(txn.id)
                .bind(&initiated.pidx)
                .execute(&self.pool)
                .await?;

                tracing::info!(booking_id = %booking.id, pidx = %initiated.pidx, "khalti payment initiated");
                Ok(PaymentInitiation::Redirect {
                    transaction_id: txn.id,
                    payment_url: initiated.payment_url,
                    pidx: initiated.pidx,
                })
            }
            PaymentMethod::Esewa => {
                let success_url = req.return_url.as_deref().ok_or_else(|| {
                    ApiError::BadRequest("return_url is required for esewa".to_string())
                })?;
                let failure_url = req.failure_url.as_deref().ok_or_else(|| {
                    ApiError::BadRequest("failure_url is required for esewa".to_string())
                })?;
                let fields = self
                    .esewa
                    .form_fields(txn.id, amount, success_url, failure_url)
                    .map_err(ApiError::from)?;

                sqlx::query(
                    "UPDATE transactions SET status = 'processing', updated_at = NOW() WHERE id = $1",
                )
                .bind(txn.id)
                .execute(&self.pool)
                .await?;

                tracing::info!(booking_id = %booking.id, txn_id = %txn.id, "esewa payment initiated");
                Ok(PaymentInitiation::FormPost {
                    transaction_id: txn.id,
                    action_url: self.esewa.action_url().to_string(),
                    fields,
                })
            }
        }
    }

    /// Reconcile a Khalti payment by asking the gateway for the
    /// authoritative state of the pidx.
    pub async fn verify_khalti(
        &self,
        actor: Actor,
        pidx: &str,
    ) -> Result<VerificationResult, ApiError> {
        let txn = self.find_by_pidx(pidx).await?;
        if txn.customer_id != actor.user_id {
            return Err(ApiError::Forbidden(
                "this transaction belongs to another user".to_string(),
            ));
        }
        if txn.status == TransactionStatus::Completed {
            // Replayed verification of an already settled transaction.
            return Ok(VerificationResult {
                payment_status: PaymentStatus::Completed,
                transaction_status: TransactionStatus::Completed,
                booking_id: txn.booking_id,
                failure_reason: None,
            });
        }
        let booking = self.bookings.load(txn.booking_id).await?;

        // Transport errors leave the transaction as-is: the user can retry,
        // and we never claim success we could not confirm.
        let lookup = self.khalti.lookup(pidx).await.map_err(ApiError::from)?;
        let lookup_json = serde_json::to_value(&LookupSnapshot::from(&lookup))?;

        let expected_paisa = to_paisa(txn.amount).map_err(ApiError::from)?;
        if lookup.outcome() == GatewayOutcome::Settled && lookup.total_amount != expected_paisa {
            let reason = format!(
                "khalti reported {} paisa, expected {}",
                lookup.total_amount, expected_paisa
            );
            self.mark_transaction_failed(txn.id, &reason, Some(&lookup_json))
                .await?;
            return Err(ApiError::from(GatewayError::AmountMismatch {
                expected: txn.amount,
                actual: rust_decimal::Decimal::from(lookup.total_amount)
                    / rust_decimal::Decimal::from(100),
            }));
        }

        match lookup.outcome() {
            GatewayOutcome::Settled => {
                self.ledger
                    .settle(
                        &booking,
                        PaymentMethod::Khalti,
                        txn.amount,
                        lookup.transaction_id.as_deref().or(Some(pidx)),
                        Some(pidx),
                        Some(&lookup_json),
                        None,
                    )
                    .await?;
                self.bookings.mark_paid_complete(booking.id).await?;
                // The transaction row flips last: a retry after a partial
                // failure finds it still processing and settles again.
                self.complete_transaction(txn.id, lookup.transaction_id.as_deref(), &lookup_json)
                    .await?;
                Ok(VerificationResult {
                    payment_status: PaymentStatus::Completed,
                    transaction_status: TransactionStatus::Completed,
                    booking_id: booking.id,
                    failure_reason: None,
                })
            }
            GatewayOutcome::StillPending => {
                sqlx::query(
                    r#"
                    UPDATE transactions SET
                        status = 'processing',
                        verification_response = $2,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(txn.id)
                .bind(&lookup_json)
                .execute(&self.pool)
                .await?;
                Ok(VerificationResult {
                    payment_status: PaymentStatus::Processing,
                    transaction_status: TransactionStatus::Processing,
                    booking_id: booking.id,
                    failure_reason: None,
                })
            }
            GatewayOutcome::Failed => {
                let reason = format!("khalti status '{}'", lookup.status);
                self.mark_transaction_failed(txn.id, &reason, Some(&lookup_json))
                    .await?;
                Ok(VerificationResult {
                    payment_status: PaymentStatus::Failed,
                    transaction_status: TransactionStatus::Failed,
                    booking_id: booking.id,
                    failure_reason: Some(reason),
                })
            }
            GatewayOutcome::Refunded => {
                sqlx::query(
                    r#"
                    UPDATE transactions SET
                        status = 'refunded',
                        verification_response = $2,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(txn.id)
                .bind(&lookup_json)
                .execute(&self.pool)
                .await?;
                self.ledger.mark_refunded(booking.id).await?;
                Ok(VerificationResult {
                    payment_status: PaymentStatus::Refunded,
                    transaction_status: TransactionStatus::Refunded,
                    booking_id: booking.id,
                    failure_reason: None,
                })
            }
        }
    }

    /// Reconcile an eSewa payment from the signed success-callback payload.
    pub async fn verify_esewa(
        &self,
        actor: Actor,
        data: &str,
    ) -> Result<VerificationResult, ApiError> {
        let callback = self.esewa.decode_callback(data).map_err(ApiError::from)?;
        let txn_id: Uuid = callback.transaction_uuid.parse().map_err(|_| {
            ApiError::BadRequest("callback does not reference a known transaction".to_string())
        })?;
        let txn = self.find_by_id(txn_id).await?;
        if txn.customer_id != actor.user_id {
            return Err(ApiError::Forbidden(
                "this transaction belongs to another user".to_string(),
            ));
        }
        if txn.status == TransactionStatus::Completed {
            return Ok(VerificationResult {
                payment_status: PaymentStatus::Completed,
                transaction_status: TransactionStatus::Completed,
                booking_id: txn.booking_id,
                failure_reason: None,
            });
        }
        let booking = self.bookings.load(txn.booking_id).await?;
        let callback_json = serde_json::to_value(&callback)?;

        if let Err(err) = self.esewa.verify(&callback, txn.amount) {
            self.mark_transaction_failed(txn.id, &err.to_string(), Some(&callback_json))
                .await?;
            return Err(ApiError::from(err));
        }

        self.ledger
            .settle(
                &booking,
                PaymentMethod::Esewa,
                txn.amount,
                Some(&callback.transaction_code),
                Some(&callback.transaction_uuid),
                Some(&callback_json),
                None,
            )
            .await?;
        self.bookings.mark_paid_complete(booking.id).await?;
        // The transaction row flips last: a retry after a partial failure
        // finds it still processing and settles again.
        self.complete_transaction(txn.id, Some(&callback.transaction_code), &callback_json)
            .await?;

        Ok(VerificationResult {
            payment_status: PaymentStatus::Completed,
            transaction_status: TransactionStatus::Completed,
            booking_id: booking.id,
            failure_reason: None,
        })
    }

    /// The provider confirms they received cash in hand. Settles the
    /// payment outside any gateway.
    pub async fn confirm_cash(
        &self,
        booking_id: Uuid,
        actor: Actor,
        req: ConfirmCashRequest,
    ) -> Result<Payment, ApiError> {
        let booking = self.bookings.load(booking_id).await?;
        if actor.role != UserRole::Provider || actor.user_id != booking.provider_id {
            return Err(ApiError::Forbidden(
                "only the provider can confirm a cash payment".to_string(),
            ));
        }
        if !matches!(
            booking.status,
            BookingStatus::InProgress | BookingStatus::Completed
        ) {
            return Err(ApiError::GuardViolation(format!(
                "cash can only be confirmed once work is underway (current status: '{}')",
                booking.status
            )));
        }

        let amount = PaymentLedger::amount_due(&booking)?;
        self.ledger
            .get_or_create(&booking, PaymentMethod::Cash)
            .await?;

        // The transaction flip, the settlement and the booking back-fill
        // commit together or not at all.
        let mut tx = self.pool.begin().await?;
        let pending: Option<GatewayTransaction> = sqlx::query_as(
            r#"
            SELECT * FROM transactions
            WHERE booking_id = $1
              AND payment_method = 'cash'
              AND status = 'pending'
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(booking.id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(pending) = pending else {
            return Err(ApiError::BadRequest(
                "no pending cash payment to confirm".to_string(),
            ));
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE transactions SET
                status = 'completed',
                notes = COALESCE($2, notes),
                completed_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(pending.id)
        .bind(&req.notes)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let payment = self
            .ledger
            .settle_in(
                &mut tx,
                &booking,
                PaymentMethod::Cash,
                amount,
                None,
                None,
                None,
                req.notes.as_deref().or(Some("cash received by provider")),
            )
            .await?;

        sqlx::query(
            "UPDATE bookings SET completed_at = COALESCE(completed_at, $2), updated_at = $2 WHERE id = $1",
        )
        .bind(booking.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(booking_id = %booking.id, txn_id = %pending.id, "cash payment confirmed");
        Ok(payment)
    }

    /// Hook for booking completion: recompute the split at the final price.
    pub async fn handle_completion(&self, booking: &Booking) -> Result<(), ApiError> {
        self.ledger.settle_on_completion(booking).await?;
        Ok(())
    }

    /// Hook for booking dispute: flag any settled payment for review.
    pub async fn handle_dispute(&self, booking_id: Uuid, reason: &str) -> Result<(), ApiError> {
        self.ledger.hold_on_dispute(booking_id, reason).await
    }

    pub async fn get_payment(&self, booking_id: Uuid, actor: Actor) -> Result<Payment, ApiError> {
        let booking = self.bookings.load(booking_id).await?;
        if !booking.is_participant(actor.user_id) {
            return Err(ApiError::Forbidden(
                "you are not a participant of this booking".to_string(),
            ));
        }
        self.ledger
            .get_for_booking(booking_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("no payment for this booking".to_string()))
    }

    /// Fetch a single transaction. Customers see their own; providers see
    /// transactions on their bookings.
    pub async fn get_transaction(
        &self,
        id: Uuid,
        actor: Actor,
    ) -> Result<GatewayTransaction, ApiError> {
        let txn = self.find_by_id(id).await?;
        if txn.customer_id != actor.user_id {
            let booking = self.bookings.load(txn.booking_id).await?;
            if booking.provider_id != actor.user_id {
                return Err(ApiError::Forbidden(
                    "this transaction belongs to another user".to_string(),
                ));
            }
        }
        Ok(txn)
    }

    /// The customer's transaction history, newest first.
    pub async fn history(
        &self,
        actor: Actor,
        pagination: Pagination,
    ) -> Result<Vec<GatewayTransaction>, ApiError> {
        let (limit, offset) = pagination.limit_offset();
        let txns = sqlx::query_as(
            r#"
            SELECT * FROM transactions
            WHERE customer_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(actor.user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(txns)
    }

    pub async fn list_transactions(
        &self,
        booking_id: Uuid,
        actor: Actor,
    ) -> Result<Vec<GatewayTransaction>, ApiError> {
        let booking = self.bookings.load(booking_id).await?;
        if !booking.is_participant(actor.user_id) {
            return Err(ApiError::Forbidden(
                "you are not a participant of this booking".to_string(),
            ));
        }
        let txns = sqlx::query_as(
            "SELECT * FROM transactions WHERE booking_id = $1 ORDER BY created_at DESC",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(txns)
    }

    async fn insert_transaction(
        &self,
        booking: &Booking,
        method: PaymentMethod,
        amount: rust_decimal::Decimal,
        req: &InitiatePaymentRequest,
    ) -> Result<GatewayTransaction, ApiError> {
        let txn = sqlx::query_as(
            r#"
            INSERT INTO transactions (
                booking_id, customer_id, payment_method, amount,
                return_url, failure_url
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .bind(booking.customer_id)
        .bind(method)
        .bind(amount)
        .bind(&req.return_url)
        .bind(&req.failure_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(txn)
    }

    async fn find_by_pidx(&self, pidx: &str) -> Result<GatewayTransaction, ApiError> {
        sqlx::query_as(
            r#"
            SELECT * FROM transactions
            WHERE gateway_payment_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(pidx)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("no transaction for this pidx".to_string()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<GatewayTransaction, ApiError> {
        sqlx::query_as("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound("transaction not found".to_string()))
    }

    async fn complete_transaction(
        &self,
        id: Uuid,
        gateway_transaction_id: Option<&str>,
        verification_response: &serde_json::Value,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            UPDATE transactions SET
                status = 'completed',
                gateway_transaction_id = COALESCE($2, gateway_transaction_id),
                verification_response = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(gateway_transaction_id)
        .bind(verification_response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_transaction_failed(
        &self,
        id: Uuid,
        reason: &str,
        verification_response: Option<&serde_json::Value>,
    ) -> Result<(), ApiError> {
        tracing::warn!(txn_id = %id, reason = %reason, "transaction failed");
        sqlx::query(
            r#"
            UPDATE transactions SET
                status = 'failed',
                failure_reason = $2,
                verification_response = COALESCE($3, verification_response),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(verification_response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Serializable snapshot of a lookup response for the audit columns
#[derive(Debug, serde::Serialize)]
struct LookupSnapshot {
    pidx: String,
    status: String,
    total_amount: i64,
    transaction_id: Option<String>,
}

impl From<&super::gateway::KhaltiLookupResponse> for LookupSnapshot {
    fn from(resp: &super::gateway::KhaltiLookupResponse) -> Self {
        Self {
            pidx: resp.pidx.clone(),
            status: resp.status.clone(),
            total_amount: resp.total_amount,
            transaction_id: resp.transaction_id.clone(),
        }
    }
}
