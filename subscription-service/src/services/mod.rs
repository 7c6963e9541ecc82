//! Services module for subscription-service.

pub mod collaborators;
pub mod concurrency;
pub mod database;
pub mod invoice;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod proration;
pub mod renewal;
pub mod store;

pub use collaborators::{
    Clock, CouponCollaborator, CouponRule, FixedClock, FlatRateTax, PaymentCollaborator,
    StaticCoupons, SystemClock, TaxCollaborator,
};
pub use concurrency::mutate;
pub use database::Database;
pub use invoice::{InvoiceAssembler, InvoiceConfig, InvoiceNumberGenerator, RandomInvoiceNumbers};
pub use lifecycle::{
    CancelOutcome, LifecycleConfig, PlanChangeKind, PlanChangeOutcome, PlanChangePreview,
    RenewalOutcome, SettlementOutcome, SubscriptionManager, TrialConversionOutcome,
};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use renewal::{RenewalConfig, RenewalOrchestrator, RenewalRunSummary, RenewalScheduler};
pub use store::{BillingStore, BillingTx};
