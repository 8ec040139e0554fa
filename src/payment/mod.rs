pub mod gateway;
pub mod ledger;
pub mod model;
pub mod service;

pub use gateway::{EsewaGateway, GatewayError, GatewayOutcome, KhaltiGateway};
pub use ledger::{compute_split, PaymentLedger, PaymentSplit};
pub use model::{
    ConfirmCashRequest, GatewayTransaction, InitiatePaymentRequest, Payment, PaymentInitiation,
    PaymentMethod, PaymentStatus, TransactionStatus, VerificationResult,
};
pub use service::PaymentService;
