//! Application startup and lifecycle management.

use crate::config::SubscriptionConfig;
use crate::services::{
    get_metrics, init_metrics, BillingStore, Clock, Database, FlatRateTax, InvoiceAssembler,
    RenewalOrchestrator, RenewalScheduler, StaticCoupons, SubscriptionManager, SystemClock,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "subscription-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "subscription-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing server and scheduler lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    db: Arc<Database>,
    manager: Arc<SubscriptionManager>,
    scheduler: RenewalScheduler,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SubscriptionConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: SubscriptionConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: SubscriptionConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let store: Arc<dyn BillingStore> = db.clone();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = &config.engine;

        let invoices = Arc::new(InvoiceAssembler::new(
            store.clone(),
            Arc::new(FlatRateTax::new(engine.tax_default_rate)),
            Arc::new(StaticCoupons::default()),
            clock.clone(),
            engine.invoice(),
        ));
        let manager = Arc::new(SubscriptionManager::new(
            store.clone(),
            invoices,
            clock,
            engine.lifecycle(),
        ));
        let renewal = engine.renewal();
        let interval = renewal.interval;
        let orchestrator = Arc::new(RenewalOrchestrator::new(
            manager.clone(),
            store,
            renewal,
        ));
        let scheduler = RenewalScheduler::new(orchestrator, interval);

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Subscription service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            db,
            manager,
            scheduler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Lifecycle manager for in-process callers.
    pub fn manager(&self) -> Arc<SubscriptionManager> {
        self.manager.clone()
    }

    /// Token that stops the renewal scheduler when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the health router and the renewal scheduler until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.db.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        let shutdown = self.shutdown.clone();
        let scheduler = tokio::spawn(self.scheduler.run(shutdown.clone()));

        tracing::info!(
            service = "subscription-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        self.shutdown.cancel();
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Renewal scheduler task failed");
        }

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }
        Ok(())
    }
}
