//! Metrics module for subscription-service.
//! Provides Prometheus metrics for lifecycle operations, renewals and invoicing.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec,
    register_int_counter_vec, CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Lifecycle operations counter
pub static OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Renewal outcomes counter
pub static RENEWALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Version conflicts counter
pub static CONFLICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices created counter
pub static INVOICES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoiced amount by currency
pub static INVOICE_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_operations_total",
                "Total subscription lifecycle operations by type"
            ),
            &["operation"]
        )
        .expect("Failed to register OPERATIONS_TOTAL")
    });

    RENEWALS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_renewals_total",
                "Total renewal attempts by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register RENEWALS_TOTAL")
    });

    CONFLICTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_conflicts_total",
                "Total optimistic concurrency conflicts"
            ),
            &["operation"]
        )
        .expect("Failed to register CONFLICTS_TOTAL")
    });

    INVOICES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_invoices_total", "Total invoices created by kind"),
            &["kind"]
        )
        .expect("Failed to register INVOICES_TOTAL")
    });

    // Invoiced amount for financial tracking
    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "subscription_invoice_amount_total",
                "Total invoiced amount by currency and kind"
            ),
            &["currency", "kind"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_operation(operation: &str) {
    if let Some(counter) = OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn record_renewal(outcome: &str) {
    if let Some(counter) = RENEWALS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_conflict(operation: &str) {
    if let Some(counter) = CONFLICTS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record an issued invoice and its total.
pub fn record_invoice(kind: &str, currency: &str, total: Decimal) {
    if let Some(counter) = INVOICES_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        let amount = total.to_f64().unwrap_or(0.0);
        counter.with_label_values(&[currency, kind]).inc_by(amount);
    }
}

pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
