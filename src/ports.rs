//! Port traits consumed by the escrow coordinator.
//!
//! Adapters live in `store` (transaction records) and `upstream` (charge
//! authority, identity verifier, marketplace hooks).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Transaction, TransactionStatus};
use crate::error::AppError;

// --- Transaction store ---

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Backend(e) => AppError::Store(e),
            StoreError::Corrupt(msg) => AppError::Internal(msg),
        }
    }
}

/// Durable record-per-transaction store.
///
/// `update_if_status` is the compare-and-swap: it persists `tx` only if the
/// stored status still equals `expected`, and reports whether the write
/// applied. Concurrent transitions against one id serialize through it.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn put(&self, tx: &Transaction) -> StoreResult<()>;
    async fn get(&self, id: &str) -> StoreResult<Option<Transaction>>;
    async fn update_if_status(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
    ) -> StoreResult<bool>;
    /// Connectivity probe for the health endpoint.
    async fn health_check(&self) -> StoreResult<()>;
}

// --- Charge authority ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Funds captured as part of confirmation (digital goods).
    Automatic,
    /// Funds held until an explicit capture (physical goods).
    Manual,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::Automatic => "automatic",
            CaptureMode::Manual => "manual",
        }
    }
}

/// Metadata attached to the held charge, mirrored from the create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeMetadata {
    pub product_id: String,
    pub seller_id: String,
    pub buyer_id: String,
    pub product_title: String,
    pub is_digital: bool,
    pub conversation_id: Option<String>,
    pub handoff_code: String,
}

#[derive(Debug, Clone)]
pub struct CreateChargeRequest {
    pub amount: i64,
    pub currency: String,
    pub capture_mode: CaptureMode,
    pub metadata: ChargeMetadata,
}

/// Upstream charge object as returned by the charge authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl Charge {
    pub fn succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

#[derive(Error, Debug)]
pub enum ChargeError {
    #[error("charge authority request timed out: {0}")]
    Timeout(String),
    #[error("charge authority circuit breaker is open")]
    CircuitOpen,
    #[error("charge authority error: {0}")]
    Upstream(String),
}

impl From<ChargeError> for AppError {
    fn from(err: ChargeError) -> Self {
        match err {
            ChargeError::Timeout(op) => AppError::UpstreamTimeout(op),
            other => AppError::ChargeAuthority(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ChargeAuthority: Send + Sync {
    async fn create(&self, req: CreateChargeRequest) -> Result<Charge, ChargeError>;
    async fn confirm(&self, charge_id: &str, payment_method_id: &str)
        -> Result<Charge, ChargeError>;
    /// Must treat a repeat capture of an already-captured charge as success.
    async fn capture(&self, charge_id: &str) -> Result<Charge, ChargeError>;
}

// --- Identity verifier / directory ---

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("user data not found: {0}")]
    UserNotFound(String),
    #[error("identity service request timed out: {0}")]
    Timeout(String),
    #[error("identity service error: {0}")]
    Upstream(String),
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidCredential(msg) => AppError::InvalidCredential(msg),
            IdentityError::UserNotFound(id) => {
                AppError::Validation(format!("user data not found: {id}"))
            }
            IdentityError::Timeout(op) => AppError::UpstreamTimeout(op),
            IdentityError::Upstream(msg) => AppError::Internal(msg),
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Validates a bearer credential and returns the stable subject id.
    async fn verify(&self, bearer_token: &str) -> Result<String, IdentityError>;
    /// Resolves a subject's organizational affiliation (school domain,
    /// lowercased), falling back to the registered email's domain. `None`
    /// means the directory record carries no usable affiliation.
    async fn affiliation(&self, subject_id: &str) -> Result<Option<String>, IdentityError>;
}

// --- Marketplace bookkeeping hooks ---

#[derive(Error, Debug)]
#[error("{0}")]
pub struct HookError(pub String);

/// Best-effort side effects owned by external collaborators. The coordinator
/// logs failures and never lets them affect the primary result.
#[async_trait]
pub trait MarketplaceHooks: Send + Sync {
    async fn mark_product_sold(&self, product_id: &str, buyer_id: &str) -> Result<(), HookError>;
    async fn increment_seller_sales(&self, seller_id: &str) -> Result<(), HookError>;
}
