//! Payment ledger and reconciliation tests against a live database

#[cfg(test)]
mod tests {
    use base64::Engine;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use sqlx::PgPool;
    use uuid::Uuid;

    use sewahub_server::booking::model::{CreateBookingRequest, ServiceLineInput};
    use sewahub_server::booking::{Actor, Booking, BookingService};
    use sewahub_server::config::{BookingPolicy, EsewaConfig, KhaltiConfig};
    use sewahub_server::models::UserRole;
    use sewahub_server::notify::Notifier;
    use sewahub_server::payment::{
        ConfirmCashRequest, EsewaGateway, InitiatePaymentRequest, KhaltiGateway, PaymentInitiation,
        PaymentLedger, PaymentMethod, PaymentService, PaymentStatus, TransactionStatus,
    };

    async fn setup_test_db() -> PgPool {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/sewahub_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    fn booking_service(pool: &PgPool) -> BookingService {
        BookingService::new(
            pool.clone(),
            BookingPolicy::default(),
            Notifier::new(None).expect("notifier"),
        )
    }

    fn payment_service(pool: &PgPool, bookings: BookingService) -> PaymentService {
        let ledger = PaymentLedger::new(pool.clone(), Decimal::new(1000, 2));
        let khalti = KhaltiGateway::new(
            KhaltiConfig {
                secret_key: "test-key".to_string(),
                base_url: "http://localhost:9/api/v2".to_string(),
            },
            std::time::Duration::from_secs(5),
        )
        .expect("khalti client");
        let esewa = EsewaGateway::new(EsewaConfig {
            merchant_code: "EPAYTEST".to_string(),
            secret_key: "test-secret".to_string(),
            payment_url: "http://localhost:9/epay/main".to_string(),
            is_test_mode: true,
        });
        PaymentService::new(pool.clone(), bookings, ledger, khalti, esewa)
    }

    fn customer() -> Actor {
        Actor {
            user_id: Uuid::new_v4(),
            role: UserRole::Customer,
        }
    }

    fn provider_for(id: Uuid) -> Actor {
        Actor {
            user_id: id,
            role: UserRole::Provider,
        }
    }

    async fn seed_booking(service: &BookingService, cust: Actor, provider_id: Uuid) -> Booking {
        let when = Utc::now() + Duration::days(2);
        let detail = service
            .create_booking(
                cust,
                CreateBookingRequest {
                    provider_id,
                    services: vec![ServiceLineInput {
                        service_id: Uuid::new_v4(),
                        title: "Wiring inspection".to_string(),
                        price: Decimal::new(200000, 2),
                        duration_minutes: Some(120),
                    }],
                    preferred_date: when.date_naive(),
                    preferred_time: when.time(),
                    emergency: false,
                    service_address: "45 Lakeside".to_string(),
                    service_city: "Pokhara".to_string(),
                    description: "Flickering lights in two rooms".to_string(),
                    special_instructions: None,
                    customer_name: "Bikash Thapa".to_string(),
                    customer_phone: "9800000002".to_string(),
                },
            )
            .await
            .expect("booking creation should succeed");
        detail.booking
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_get_or_create_is_single_row() {
        let pool = setup_test_db().await;
        let ledger = PaymentLedger::new(pool.clone(), Decimal::new(1000, 2));
        let booking = seed_booking(&booking_service(&pool), customer(), Uuid::new_v4()).await;

        let first = ledger
            .get_or_create(&booking, PaymentMethod::Cash)
            .await
            .expect("first create");
        let second = ledger
            .get_or_create(&booking, PaymentMethod::Khalti)
            .await
            .expect("second fetch");

        assert_eq!(first.id, second.id, "booking must have exactly one payment row");
        assert_eq!(second.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_settlement_is_idempotent() {
        let pool = setup_test_db().await;
        let ledger = PaymentLedger::new(pool.clone(), Decimal::new(1000, 2));
        let booking = seed_booking(&booking_service(&pool), customer(), Uuid::new_v4()).await;
        let amount = Decimal::new(200000, 2);

        let settled = ledger
            .settle(
                &booking,
                PaymentMethod::Khalti,
                amount,
                Some("txn-1"),
                Some("pidx-1"),
                None,
                None,
            )
            .await
            .expect("first settlement");
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert_eq!(settled.platform_fee, Decimal::new(20000, 2));
        assert_eq!(settled.provider_amount, Decimal::new(180000, 2));

        // Replayed callback: nothing changes, including the references.
        let replayed = ledger
            .settle(
                &booking,
                PaymentMethod::Esewa,
                Decimal::new(999900, 2),
                Some("txn-2"),
                None,
                None,
                None,
            )
            .await
            .expect("replayed settlement");
        assert_eq!(replayed.amount, amount);
        assert_eq!(replayed.payment_method, PaymentMethod::Khalti);
        assert_eq!(replayed.transaction_id.as_deref(), Some("txn-1"));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_dispute_hold_annotates_without_unsettling() {
        let pool = setup_test_db().await;
        let ledger = PaymentLedger::new(pool.clone(), Decimal::new(1000, 2));
        let booking = seed_booking(&booking_service(&pool), customer(), Uuid::new_v4()).await;

        ledger
            .settle(
                &booking,
                PaymentMethod::Cash,
                Decimal::new(200000, 2),
                None,
                None,
                None,
                None,
            )
            .await
            .expect("settlement");
        ledger
            .hold_on_dispute(booking.id, "work left unfinished")
            .await
            .expect("hold");

        let payment = ledger
            .get_for_booking(booking.id)
            .await
            .expect("fetch")
            .expect("payment exists");
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment
            .notes
            .as_deref()
            .unwrap_or_default()
            .contains("disputed"));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_completion_settles_pending_payment() {
        let pool = setup_test_db().await;
        let ledger = PaymentLedger::new(pool.clone(), Decimal::new(1000, 2));
        let mut booking = seed_booking(&booking_service(&pool), customer(), Uuid::new_v4()).await;

        // A cash initiation leaves the payment pending; completing the
        // booking must settle it at the final price.
        ledger
            .get_or_create(&booking, PaymentMethod::Cash)
            .await
            .expect("pending payment");

        booking.final_price = Some(Decimal::new(250000, 2));
        let payment = ledger
            .settle_on_completion(&booking)
            .await
            .expect("settle")
            .expect("payment exists");
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.amount, Decimal::new(250000, 2));
        assert_eq!(payment.platform_fee, Decimal::new(25000, 2));
        assert_eq!(payment.provider_amount, Decimal::new(225000, 2));
        assert!(payment.paid_at.is_some());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_completion_never_rewrites_settled_amounts() {
        let pool = setup_test_db().await;
        let ledger = PaymentLedger::new(pool.clone(), Decimal::new(1000, 2));
        let mut booking = seed_booking(&booking_service(&pool), customer(), Uuid::new_v4()).await;

        ledger
            .settle(
                &booking,
                PaymentMethod::Cash,
                Decimal::new(200000, 2),
                None,
                None,
                None,
                None,
            )
            .await
            .expect("settlement");

        // A later final price must not reopen the frozen split.
        booking.final_price = Some(Decimal::new(250000, 2));
        let payment = ledger
            .settle_on_completion(&booking)
            .await
            .expect("settle")
            .expect("payment exists");
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.amount, Decimal::new(200000, 2));
        assert_eq!(payment.platform_fee, Decimal::new(20000, 2));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_completion_without_payment_is_noop() {
        let pool = setup_test_db().await;
        let ledger = PaymentLedger::new(pool.clone(), Decimal::new(1000, 2));
        let booking = seed_booking(&booking_service(&pool), customer(), Uuid::new_v4()).await;

        let payment = ledger
            .settle_on_completion(&booking)
            .await
            .expect("settle");
        assert!(payment.is_none(), "completion must not invent a payment");
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_confirm_cash_settles_pending_transaction() {
        let pool = setup_test_db().await;
        let bookings = booking_service(&pool);
        let payments = payment_service(&pool, bookings.clone());

        let cust = customer();
        let provider_id = Uuid::new_v4();
        let prov = provider_for(provider_id);
        let booking = seed_booking(&bookings, cust, provider_id).await;
        bookings.accept(booking.id, prov).await.expect("accept");
        bookings.start(booking.id, prov).await.expect("start");

        let initiation = payments
            .initiate(
                cust,
                InitiatePaymentRequest {
                    booking_id: booking.id,
                    payment_method: PaymentMethod::Cash,
                    return_url: None,
                    failure_url: None,
                },
            )
            .await
            .expect("initiate");
        let txn_id = match initiation {
            PaymentInitiation::Recorded { transaction_id } => transaction_id,
            other => panic!("expected recorded cash initiation, got {:?}", other),
        };

        let payment = payments
            .confirm_cash(booking.id, prov, ConfirmCashRequest { notes: None })
            .await
            .expect("confirm");
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.paid_at.is_some());

        // The transaction created at initiation is the one that completed;
        // no extra row appears.
        let txn = payments.get_transaction(txn_id, cust).await.expect("txn");
        assert_eq!(txn.status, TransactionStatus::Completed);
        assert!(txn.completed_at.is_some());
        let txns = payments
            .list_transactions(booking.id, prov)
            .await
            .expect("list");
        assert_eq!(txns.len(), 1);

        // Completion time is back-filled on the booking.
        let detail = bookings.get_booking(booking.id, cust).await.expect("read");
        assert!(detail.booking.completed_at.is_some());

        // With no pending cash transaction left, a replay is rejected.
        let replay = payments
            .confirm_cash(booking.id, prov, ConfirmCashRequest { notes: None })
            .await;
        assert!(replay.is_err(), "nothing left to confirm");
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_double_esewa_verification_settles_once() {
        let pool = setup_test_db().await;
        let bookings = booking_service(&pool);
        let payments = payment_service(&pool, bookings.clone());

        let cust = customer();
        let booking = seed_booking(&bookings, cust, Uuid::new_v4()).await;

        let initiation = payments
            .initiate(
                cust,
                InitiatePaymentRequest {
                    booking_id: booking.id,
                    payment_method: PaymentMethod::Esewa,
                    return_url: Some("https://app.test/return".to_string()),
                    failure_url: Some("https://app.test/failure".to_string()),
                },
            )
            .await
            .expect("initiate");
        let txn_id = match initiation {
            PaymentInitiation::FormPost { transaction_id, .. } => transaction_id,
            other => panic!("expected form post initiation, got {:?}", other),
        };

        let callback = serde_json::json!({
            "transaction_code": "000ABCD",
            "status": "COMPLETE",
            "total_amount": "2,000.0",
            "transaction_uuid": txn_id.to_string(),
            "product_code": "EPAYTEST",
            "signed_field_names": "transaction_code,status,total_amount,transaction_uuid,product_code,signed_field_names",
            "signature": "unchecked-in-test-mode",
        });
        let data = base64::engine::general_purpose::STANDARD.encode(callback.to_string());

        let first = payments.verify_esewa(cust, &data).await.expect("first verify");
        assert_eq!(first.payment_status, PaymentStatus::Completed);

        let second = payments.verify_esewa(cust, &data).await.expect("second verify");
        assert_eq!(second.payment_status, PaymentStatus::Completed);
        assert_eq!(second.booking_id, booking.id);

        // One payment row, settled once at the transaction amount.
        let payment = payments.get_payment(booking.id, cust).await.expect("payment");
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.amount, Decimal::new(200000, 2));
        assert_eq!(payment.platform_fee, Decimal::new(20000, 2));

        let txn = payments.get_transaction(txn_id, cust).await.expect("txn");
        assert_eq!(txn.status, TransactionStatus::Completed);
    }
}
