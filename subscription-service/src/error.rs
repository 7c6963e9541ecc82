//! Error taxonomy for the subscription engine.

use service_core::error::AppError;
use service_core::retry::Retryable;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Caller supplied bad input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The stored version no longer matches the caller's expected version.
    /// Safe to retry after re-reading the subscription.
    #[error("Version conflict on subscription {subscription_id}: expected version {expected_version}")]
    Conflict {
        subscription_id: Uuid,
        expected_version: i64,
    },

    #[error("User {0} already has a subscription")]
    DuplicateSubscription(Uuid),

    #[error("Billing cycle mismatch: cannot change a {current} subscription to a {requested} plan")]
    BillingCycleMismatch { current: String, requested: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Generated invoice number already exists. The whole operation may be retried.
    #[error("Invoice number collision: {0}")]
    InvoiceNumberCollision(String),

    /// Tax, coupon or payment collaborator failed or missed its deadline.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl BillingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BillingError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        BillingError::NotFound(msg.into())
    }

    pub fn collaborator_timeout(name: &str, deadline: Duration) -> Self {
        BillingError::Collaborator(format!(
            "{} did not respond within {}ms",
            name,
            deadline.as_millis()
        ))
    }

    /// True when repeating the operation with fresh state can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Conflict { .. } | BillingError::InvoiceNumberCollision(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation",
            BillingError::Conflict { .. } => "conflict",
            BillingError::DuplicateSubscription(_) => "duplicate_subscription",
            BillingError::BillingCycleMismatch { .. } => "billing_cycle_mismatch",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvoiceNumberCollision(_) => "invoice_number_collision",
            BillingError::Collaborator(_) => "collaborator",
            BillingError::Database(_) => "database",
        }
    }
}

impl Retryable for BillingError {
    fn is_retryable(&self) -> bool {
        BillingError::is_retryable(self)
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(anyhow::Error::new(err))
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(_) | BillingError::BillingCycleMismatch { .. } => {
                AppError::BadRequest(anyhow::Error::new(err))
            }
            BillingError::NotFound(_) => AppError::NotFound(anyhow::Error::new(err)),
            BillingError::Conflict { .. }
            | BillingError::DuplicateSubscription(_)
            | BillingError::InvoiceNumberCollision(_) => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            BillingError::Collaborator(msg) => AppError::BadGateway(msg),
            BillingError::Database(e) => AppError::DatabaseError(e),
        }
    }
}
