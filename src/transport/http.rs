//! HTTP transport for the schema broker.
//!
//! Thin axum layer: extract, call [`SchemaService`], let [`BrokerError`]'s
//! `IntoResponse` pick the status code.

use crate::db::{PgConnector, PoolProvider, PoolRegistry};
use crate::error::{BrokerError, BrokerResult};
use crate::models::{CredentialsAdded, RegisterCredentials, SchemaResult};
use crate::service::SchemaService;
use crate::transport::Transport;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Build the application router.
pub fn router<P>(service: SchemaService<P>) -> Router
where
    P: PoolProvider<Pool = PgPool>,
{
    Router::new()
        .route("/credentials", post(add_credentials::<P>))
        .route("/health", get(health::<P>))
        .route("/{database_id}", get(get_schema::<P>))
        .route("/search/{database_id}/{table_name}", get(search_table::<P>))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

fn parse_database_id(raw: &str) -> BrokerResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| BrokerError::validation(format!("database_id must be an integer (got '{}')", raw)))
}

async fn add_credentials<P>(
    State(service): State<SchemaService<P>>,
    payload: Result<Json<RegisterCredentials>, JsonRejection>,
) -> BrokerResult<Json<CredentialsAdded>>
where
    P: PoolProvider<Pool = PgPool>,
{
    let Json(payload) = payload.map_err(|rejection| BrokerError::validation(rejection.body_text()))?;
    let added = service.register(&payload).await?;
    Ok(Json(added))
}

async fn get_schema<P>(
    State(service): State<SchemaService<P>>,
    Path(database_id): Path<String>,
) -> BrokerResult<Json<SchemaResult>>
where
    P: PoolProvider<Pool = PgPool>,
{
    let database_id = parse_database_id(&database_id)?;
    Ok(Json(service.describe_database(database_id).await?))
}

async fn search_table<P>(
    State(service): State<SchemaService<P>>,
    Path((database_id, table_name)): Path<(String, String)>,
) -> BrokerResult<Json<SchemaResult>>
where
    P: PoolProvider<Pool = PgPool>,
{
    let database_id = parse_database_id(&database_id)?;
    Ok(Json(service.search_table(database_id, &table_name).await?))
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    version: &'static str,
    timestamp: String,
    pools: usize,
    active_leases: usize,
}

async fn health<P>(State(service): State<SchemaService<P>>) -> (StatusCode, Json<HealthReport>)
where
    P: PoolProvider<Pool = PgPool>,
{
    let (status, code) = match service.store().ping().await {
        Ok(()) => ("ok", StatusCode::OK),
        Err(e) => {
            warn!(error = %e, "Metadata store health check failed");
            ("degraded", StatusCode::SERVICE_UNAVAILABLE)
        }
    };
    let stats = service.stats().await;

    (
        code,
        Json(HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: chrono::Utc::now().to_rfc3339(),
            pools: stats.pools,
            active_leases: stats.active_leases,
        }),
    )
}

/// HTTP transport implementation.
pub struct HttpTransport<P = PoolRegistry<PgConnector>> {
    service: SchemaService<P>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl<P> HttpTransport<P>
where
    P: PoolProvider<Pool = PgPool>,
{
    pub fn new(service: SchemaService<P>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service,
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl<P> Transport for HttpTransport<P>
where
    P: PoolProvider<Pool = PgPool>,
{
    async fn run(&self) -> BrokerResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting schema broker on {}", bind_addr);

        let app = router(self.service.clone());

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            BrokerError::internal(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_signal())
            .await;

        // Close pools whether the server stopped cleanly or not
        self.service.shutdown().await;

        match result {
            Ok(()) => {
                info!("HTTP server stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "HTTP server error");
                Err(BrokerError::internal(format!("HTTP server error: {}", e)))
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
