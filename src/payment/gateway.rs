//! Payment gateway clients.
//!
//! Two integration styles are supported. Khalti is redirect-and-lookup: we
//! initiate server side, send the user to the returned URL, then ask the
//! gateway what happened. eSewa is form-post: we sign a set of form fields,
//! the client submits them, and the gateway calls back with a signed
//! payload we verify locally. All HTTP calls carry a bounded timeout.

use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{EsewaConfig, KhaltiConfig};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    BadResponse { status: u16, body: String },

    #[error("paid amount {actual} does not match the expected amount {expected}")]
    AmountMismatch { expected: Decimal, actual: Decimal },

    #[error("callback signature verification failed")]
    InvalidSignature,

    #[error("malformed gateway payload: {0}")]
    Malformed(String),

    #[error("amount {0} cannot be represented for the gateway")]
    UnrepresentableAmount(Decimal),
}

/// What a gateway ultimately said about a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOutcome {
    Settled,
    StillPending,
    Failed,
    Refunded,
}

/// Convert an NPR amount to the paisa integer Khalti expects
pub fn to_paisa(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or(GatewayError::UnrepresentableAmount(amount))
}

// ---------------------------------------------------------------------------
// Khalti (redirect-and-lookup)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct KhaltiInitiatePayload<'a> {
    return_url: &'a str,
    website_url: &'a str,
    amount: i64,
    purchase_order_id: String,
    purchase_order_name: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct KhaltiInitiateResponse {
    pub pidx: String,
    pub payment_url: String,
}

#[derive(Debug, Deserialize)]
pub struct KhaltiLookupResponse {
    pub pidx: String,
    pub status: String,
    pub total_amount: i64,
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub refunded: bool,
}

impl KhaltiLookupResponse {
    pub fn outcome(&self) -> GatewayOutcome {
        match self.status.as_str() {
            "Completed" => GatewayOutcome::Settled,
            "Pending" | "Initiated" => GatewayOutcome::StillPending,
            "Refunded" => GatewayOutcome::Refunded,
            // "Expired", "User canceled" and anything unrecognised
            _ => GatewayOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KhaltiGateway {
    client: reqwest::Client,
    config: KhaltiConfig,
}

impl KhaltiGateway {
    pub fn new(config: KhaltiConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }

    /// Register a payment with Khalti and get the redirect URL.
    pub async fn initiate(
        &self,
        transaction_id: Uuid,
        amount: Decimal,
        order_name: &str,
        return_url: &str,
        website_url: &str,
    ) -> Result<KhaltiInitiateResponse, GatewayError> {
        let payload = KhaltiInitiatePayload {
            return_url,
            website_url,
            amount: to_paisa(amount)?,
            purchase_order_id: transaction_id.to_string(),
            purchase_order_name: order_name,
        };
        let url = format!("{}/epayment/initiate/", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("key {}", self.config.secret_key))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status, %body, "khalti initiate rejected");
            return Err(GatewayError::BadResponse { status, body });
        }
        Ok(resp.json().await?)
    }

    /// Ask Khalti for the authoritative state of a payment.
    pub async fn lookup(&self, pidx: &str) -> Result<KhaltiLookupResponse, GatewayError> {
        let url = format!("{}/epayment/lookup/", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("key {}", self.config.secret_key))
            .json(&serde_json::json!({ "pidx": pidx }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status, %body, "khalti lookup rejected");
            return Err(GatewayError::BadResponse { status, body });
        }
        Ok(resp.json().await?)
    }
}

// ---------------------------------------------------------------------------
// eSewa (signed form post)
// ---------------------------------------------------------------------------

/// Decoded success-callback payload from eSewa
#[derive(Debug, Deserialize, Serialize)]
pub struct EsewaCallback {
    pub transaction_code: String,
    pub status: String,
    pub total_amount: String,
    pub transaction_uuid: String,
    pub product_code: String,
    pub signed_field_names: String,
    pub signature: String,
}

impl EsewaCallback {
    /// eSewa renders amounts with thousands separators ("1,000.0").
    pub fn amount(&self) -> Result<Decimal, GatewayError> {
        let cleaned = self.total_amount.replace(',', "");
        cleaned
            .parse::<Decimal>()
            .map_err(|_| GatewayError::Malformed(format!("bad amount '{}'", self.total_amount)))
    }
}

#[derive(Debug, Clone)]
pub struct EsewaGateway {
    config: EsewaConfig,
}

impl EsewaGateway {
    pub fn new(config: EsewaConfig) -> Self {
        Self { config }
    }

    pub fn action_url(&self) -> &str {
        &self.config.payment_url
    }

    /// Build the signed form fields the client submits to eSewa.
    pub fn form_fields(
        &self,
        transaction_uuid: Uuid,
        amount: Decimal,
        success_url: &str,
        failure_url: &str,
    ) -> Result<Vec<(String, String)>, GatewayError> {
        let amount = amount.round_dp(2).to_string();
        let uuid = transaction_uuid.to_string();
        let signature = self.sign(&format!(
            "total_amount={},transaction_uuid={},product_code={}",
            amount, uuid, self.config.merchant_code
        ))?;

        Ok(vec![
            ("amount".to_string(), amount.clone()),
            ("tax_amount".to_string(), "0".to_string()),
            ("total_amount".to_string(), amount),
            ("transaction_uuid".to_string(), uuid),
            ("product_code".to_string(), self.config.merchant_code.clone()),
            ("product_service_charge".to_string(), "0".to_string()),
            ("product_delivery_charge".to_string(), "0".to_string()),
            ("success_url".to_string(), success_url.to_string()),
            ("failure_url".to_string(), failure_url.to_string()),
            (
                "signed_field_names".to_string(),
                "total_amount,transaction_uuid,product_code".to_string(),
            ),
            ("signature".to_string(), signature),
        ])
    }

    /// Decode the base64 JSON payload from the success redirect.
    pub fn decode_callback(&self, data: &str) -> Result<EsewaCallback, GatewayError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|err| GatewayError::Malformed(format!("invalid base64: {}", err)))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| GatewayError::Malformed(format!("invalid callback JSON: {}", err)))
    }

    /// Verify a decoded callback against the expected amount.
    ///
    /// The amount check is a hard failure either way. The signature check is
    /// skipped in test mode because the sandbox signs with a key we do not
    /// hold.
    pub fn verify(
        &self,
        callback: &EsewaCallback,
        expected_amount: Decimal,
    ) -> Result<(), GatewayError> {
        if callback.status != "COMPLETE" {
            return Err(GatewayError::Malformed(format!(
                "unexpected callback status '{}'",
                callback.status
            )));
        }

        // Decimal equality is numeric, so "1000.0" matches 1000.00 while
        // any real discrepancy fails.
        let actual = callback.amount()?;
        if actual != expected_amount {
            return Err(GatewayError::AmountMismatch {
                expected: expected_amount,
                actual,
            });
        }

        if self.config.is_test_mode {
            tracing::debug!("esewa test mode, skipping signature verification");
            return Ok(());
        }

        let message: String = callback
            .signed_field_names
            .split(',')
            .map(|field| {
                let value = match field {
                    "transaction_code" => callback.transaction_code.as_str(),
                    "status" => callback.status.as_str(),
                    "total_amount" => callback.total_amount.as_str(),
                    "transaction_uuid" => callback.transaction_uuid.as_str(),
                    "product_code" => callback.product_code.as_str(),
                    "signed_field_names" => callback.signed_field_names.as_str(),
                    _ => "",
                };
                format!("{}={}", field, value)
            })
            .collect::<Vec<_>>()
            .join(",");

        let expected = self.sign(&message)?;
        if expected != callback.signature {
            return Err(GatewayError::InvalidSignature);
        }
        Ok(())
    }

    fn sign(&self, message: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.config.secret_key.as_bytes())
            .map_err(|_| GatewayError::Malformed("invalid signing key".to_string()))?;
        mac.update(message.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esewa(test_mode: bool) -> EsewaGateway {
        EsewaGateway::new(EsewaConfig {
            merchant_code: "EPAYTEST".to_string(),
            secret_key: "8gBm/:&EnhH.1/q".to_string(),
            payment_url: "https://rc-epay.esewa.com.np/api/epay/main/v2/form".to_string(),
            is_test_mode: test_mode,
        })
    }

    fn callback(amount: &str) -> EsewaCallback {
        EsewaCallback {
            transaction_code: "000AWEO".to_string(),
            status: "COMPLETE".to_string(),
            total_amount: amount.to_string(),
            transaction_uuid: "241028-103605".to_string(),
            product_code: "EPAYTEST".to_string(),
            signed_field_names: "transaction_code,status,total_amount,transaction_uuid,product_code,signed_field_names".to_string(),
            signature: "unchecked-in-test-mode".to_string(),
        }
    }

    #[test]
    fn khalti_client_builds_with_timeout() {
        let gw = KhaltiGateway::new(
            KhaltiConfig {
                secret_key: "test-key".to_string(),
                base_url: "https://dev.khalti.com/api/v2".to_string(),
            },
            Duration::from_secs(5),
        );
        assert!(gw.is_ok());
    }

    #[test]
    fn paisa_conversion_rounds_to_integer() {
        assert_eq!(to_paisa(Decimal::new(150000, 2)).unwrap(), 150000);
        assert_eq!(to_paisa(Decimal::new(9950, 2)).unwrap(), 9950);
        assert_eq!(to_paisa(Decimal::from(10)).unwrap(), 1000);
    }

    #[test]
    fn khalti_status_mapping() {
        let mut resp = KhaltiLookupResponse {
            pidx: "x".to_string(),
            status: "Completed".to_string(),
            total_amount: 1000,
            transaction_id: None,
            refunded: false,
        };
        assert_eq!(resp.outcome(), GatewayOutcome::Settled);
        resp.status = "Pending".to_string();
        assert_eq!(resp.outcome(), GatewayOutcome::StillPending);
        resp.status = "Initiated".to_string();
        assert_eq!(resp.outcome(), GatewayOutcome::StillPending);
        resp.status = "Expired".to_string();
        assert_eq!(resp.outcome(), GatewayOutcome::Failed);
        resp.status = "User canceled".to_string();
        assert_eq!(resp.outcome(), GatewayOutcome::Failed);
        resp.status = "Refunded".to_string();
        assert_eq!(resp.outcome(), GatewayOutcome::Refunded);
    }

    #[test]
    fn esewa_amount_parsing_strips_separators() {
        assert_eq!(callback("1,000.0").amount().unwrap(), Decimal::new(10000, 1));
        assert_eq!(callback("110.5").amount().unwrap(), Decimal::new(1105, 1));
    }

    #[test]
    fn esewa_amount_mismatch_is_a_hard_failure() {
        let gw = esewa(true);
        let err = gw
            .verify(&callback("110.0"), Decimal::new(12000, 2))
            .unwrap_err();
        assert!(matches!(err, GatewayError::AmountMismatch { .. }));
    }

    #[test]
    fn esewa_exact_amount_passes_in_test_mode() {
        let gw = esewa(true);
        gw.verify(&callback("110.0"), Decimal::new(11000, 2)).unwrap();
    }

    #[test]
    fn esewa_incomplete_status_rejected() {
        let gw = esewa(true);
        let mut cb = callback("110.0");
        cb.status = "PENDING".to_string();
        assert!(gw.verify(&cb, Decimal::new(11000, 2)).is_err());
    }

    #[test]
    fn esewa_signature_checked_outside_test_mode() {
        let gw = esewa(false);
        let err = gw
            .verify(&callback("110.0"), Decimal::new(11000, 2))
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSignature));
    }

    #[test]
    fn esewa_valid_signature_accepted() {
        let gw = esewa(false);
        let mut cb = callback("110.0");
        let message = format!(
            "transaction_code={},status={},total_amount={},transaction_uuid={},product_code={},signed_field_names={}",
            cb.transaction_code,
            cb.status,
            cb.total_amount,
            cb.transaction_uuid,
            cb.product_code,
            cb.signed_field_names
        );
        cb.signature = gw.sign(&message).unwrap();
        gw.verify(&cb, Decimal::new(11000, 2)).unwrap();
    }

    #[test]
    fn esewa_form_fields_are_signed() {
        let gw = esewa(true);
        let fields = gw
            .form_fields(
                Uuid::nil(),
                Decimal::new(150000, 2),
                "https://app.example/success",
                "https://app.example/failure",
            )
            .unwrap();
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("total_amount"), "1500.00");
        assert_eq!(get("product_code"), "EPAYTEST");
        assert!(!get("signature").is_empty());
        assert_eq!(
            get("signed_field_names"),
            "total_amount,transaction_uuid,product_code"
        );
    }
}
