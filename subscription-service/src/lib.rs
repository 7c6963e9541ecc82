//! Subscription Service - subscription lifecycle and proration billing engine.
//!
//! The engine is organised leaves-first:
//!
//! - [`models`]: plan catalog, subscription aggregate, history, invoices.
//! - [`services::proration`]: pure charge/credit arithmetic.
//! - [`services::concurrency`]: compare-and-swap writes on the version column.
//! - [`services::lifecycle`]: the subscription state machine.
//! - [`services::invoice`]: invoice assembly, coupons, voiding.
//! - [`services::renewal`]: batch renewal, trial conversion and payment retry.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;

pub use error::{BillingError, BillingResult};
