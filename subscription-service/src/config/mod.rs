//! Configuration module for subscription-service.

use crate::models::TaxLocation;
use crate::services::{InvoiceConfig, LifecycleConfig, RenewalConfig};
use rust_decimal::Decimal;
use service_core::config::{self as core_config, Config};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Knobs of the billing engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub renewal_interval_secs: u64,
    pub renewal_lookahead_hours: i64,
    pub renewal_batch_size: i64,
    pub renewal_max_conflict_retries: u32,
    pub renewal_retry_delay_ms: u64,
    pub renewal_concurrency: usize,
    pub payment_max_attempts: i32,
    pub payment_retry_hours: i64,
    pub proration_grace_hours: i64,
    pub invoice_due_days: i64,
    pub tax_fallback_country: String,
    pub tax_fallback_state: Option<String>,
    pub tax_default_rate: Decimal,
    pub collaborator_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            renewal_interval_secs: 300,
            renewal_lookahead_hours: 0,
            renewal_batch_size: 500,
            renewal_max_conflict_retries: 3,
            renewal_retry_delay_ms: 250,
            renewal_concurrency: 8,
            payment_max_attempts: 3,
            payment_retry_hours: 24,
            proration_grace_hours: 24,
            invoice_due_days: 7,
            tax_fallback_country: "US".to_string(),
            tax_fallback_state: None,
            tax_default_rate: Decimal::ZERO,
            collaborator_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            renewal_interval_secs: Config::env_or(
                "RENEWAL_INTERVAL_SECS",
                defaults.renewal_interval_secs,
            ),
            renewal_lookahead_hours: Config::env_or(
                "RENEWAL_LOOKAHEAD_HOURS",
                defaults.renewal_lookahead_hours,
            ),
            renewal_batch_size: Config::env_or("RENEWAL_BATCH_SIZE", defaults.renewal_batch_size),
            renewal_max_conflict_retries: Config::env_or(
                "RENEWAL_MAX_CONFLICT_RETRIES",
                defaults.renewal_max_conflict_retries,
            ),
            renewal_retry_delay_ms: Config::env_or(
                "RENEWAL_RETRY_DELAY_MS",
                defaults.renewal_retry_delay_ms,
            ),
            renewal_concurrency: Config::env_or(
                "RENEWAL_CONCURRENCY",
                defaults.renewal_concurrency,
            ),
            payment_max_attempts: Config::env_or(
                "PAYMENT_MAX_ATTEMPTS",
                defaults.payment_max_attempts,
            ),
            payment_retry_hours: Config::env_or(
                "PAYMENT_RETRY_HOURS",
                defaults.payment_retry_hours,
            ),
            proration_grace_hours: Config::env_or(
                "PRORATION_GRACE_HOURS",
                defaults.proration_grace_hours,
            ),
            invoice_due_days: Config::env_or("INVOICE_DUE_DAYS", defaults.invoice_due_days),
            tax_fallback_country: env::var("TAX_FALLBACK_COUNTRY")
                .unwrap_or(defaults.tax_fallback_country),
            tax_fallback_state: env::var("TAX_FALLBACK_STATE").ok(),
            tax_default_rate: Config::env_or("TAX_DEFAULT_RATE", defaults.tax_default_rate),
            collaborator_timeout_ms: Config::env_or(
                "COLLABORATOR_TIMEOUT_MS",
                defaults.collaborator_timeout_ms,
            ),
        }
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            grace_period: chrono::Duration::hours(self.proration_grace_hours),
            renewal_lookahead: chrono::Duration::hours(self.renewal_lookahead_hours),
            payment_max_attempts: self.payment_max_attempts.max(1),
            payment_retry_interval: chrono::Duration::hours(self.payment_retry_hours),
        }
    }

    pub fn invoice(&self) -> InvoiceConfig {
        InvoiceConfig {
            due_days: self.invoice_due_days,
            fallback_location: TaxLocation::new(
                self.tax_fallback_country.clone(),
                self.tax_fallback_state.clone(),
            ),
            collaborator_timeout: self.collaborator_timeout(),
        }
    }

    pub fn renewal(&self) -> RenewalConfig {
        RenewalConfig {
            interval: Duration::from_secs(self.renewal_interval_secs.max(1)),
            batch_size: self.renewal_batch_size,
            max_conflict_retries: self.renewal_max_conflict_retries,
            retry_delay: Duration::from_millis(self.renewal_retry_delay_ms),
            concurrency: self.renewal_concurrency.max(1),
            payment_timeout: self.collaborator_timeout(),
        }
    }
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "subscription-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: Config::env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: Config::env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            engine: EngineConfig::from_env(),
        })
    }
}
