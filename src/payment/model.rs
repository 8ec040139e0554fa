//! Payment models and data structures

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Settlement state of a booking's payment
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
    Cancelled,
}

/// State of a single gateway interaction
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payment_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Khalti,
    Esewa,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Khalti => "khalti",
            PaymentMethod::Esewa => "esewa",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single authoritative payment row per booking
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,

    pub amount: Decimal,
    pub platform_fee_percentage: Decimal,
    pub platform_fee: Decimal,
    pub provider_amount: Decimal,

    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub reference_number: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub notes: Option<String>,

    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-style log of one gateway interaction (or cash record)
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct GatewayTransaction {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,

    pub payment_method: PaymentMethod,
    pub amount: Decimal,
    pub status: TransactionStatus,

    pub gateway_transaction_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub verification_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,

    pub return_url: Option<String>,
    pub failure_url: Option<String>,
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub booking_id: Uuid,
    pub payment_method: PaymentMethod,
    pub return_url: Option<String>,
    pub failure_url: Option<String>,
}

/// What the client needs to continue a freshly initiated payment. The shape
/// depends on how the chosen gateway hands control back.
#[derive(Debug, Serialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum PaymentInitiation {
    /// Redirect-and-lookup flow: send the user to `payment_url`, then call
    /// the verify endpoint with `pidx`.
    Redirect {
        transaction_id: Uuid,
        payment_url: String,
        pidx: String,
    },
    /// Form-post flow: the client submits `fields` to `action_url` as an
    /// HTML form; the gateway calls back with a signed payload.
    FormPost {
        transaction_id: Uuid,
        action_url: String,
        fields: Vec<(String, String)>,
    },
    /// Nothing to hand off; the provider confirms receipt later.
    Recorded { transaction_id: Uuid },
}

#[derive(Debug, Deserialize)]
pub struct VerifyKhaltiRequest {
    pub pidx: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEsewaRequest {
    /// Base64 payload eSewa appends to the success redirect
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmCashRequest {
    pub notes: Option<String>,
}

/// Result of a verification attempt, returned to the client
#[derive(Debug, Serialize)]
pub struct VerificationResult {
    pub payment_status: PaymentStatus,
    pub transaction_status: TransactionStatus,
    pub booking_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}
