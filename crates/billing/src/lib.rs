//! Classbook Billing
//!
//! Payment bookkeeping and the monthly billing workflow:
//! - Order id allocation and payment link generation
//! - Payment status tracking across redirect, confirm and webhook triggers
//! - Month key derivation for billing documents
//! - Check1/check2 documents and the billing status log

pub mod checks;
pub mod client;
pub mod error;
pub mod month_key;
pub mod order_id;
pub mod payment;
pub mod service;
pub mod webhook;

pub use checks::{BillingCheckService, BillingStatusRow, BillingStep, CheckKind, CheckSaved};
pub use client::{GatewayConfig, GatewayPayment, PaymentGatewayClient, PaymentLinkRequest};
pub use error::{BillingError, BillingResult};
pub use month_key::{current_month_key, derive_month_key, now_in_offset, MonthKey, MonthKeySource};
pub use order_id::{validate_order_id, OrderIdAllocator, OrderIdStrategy};
pub use payment::{
    GatewayUpdate, NewPayment, Payment, PaymentService, PaymentStatus, StatusHistoryEntry, StatusUpdate,
    UpdateSource,
};
pub use service::{BillingService, PaymentLink, PaymentLinkInput};
pub use webhook::{sign, verify_signature, WebhookPayload, SIGNATURE_HEADER};
