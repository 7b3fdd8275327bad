//! Schema broker - Main entry point.
//!
//! Stores downstream database credentials and serves their live schema
//! over HTTP.

use clap::Parser;
use schema_broker::config::Config;
use schema_broker::db::{CredentialStore, PgConnector, PoolRegistry, SchemaInspector};
use schema_broker::secret::{SecretCipher, SecretCodec};
use schema_broker::service::SchemaService;
use schema_broker::transport::{HttpTransport, Transport};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    if let Err(message) = config.validate() {
        eprintln!("Error: {}", message);
        eprintln!();
        eprintln!("Usage: schema-broker --secret-key <BASE64> [--metadata-url <URL>]");
        eprintln!();
        eprintln!("Generate a key with:");
        eprintln!("  head -c 32 /dev/urandom | base64");
        std::process::exit(1);
    }

    info!("Starting schema broker v{}", env!("CARGO_PKG_VERSION"));

    let secret_key = config.secret_key.as_deref().unwrap_or_default();
    let codec = SecretCodec::new(SecretCipher::from_base64(secret_key)?);

    let store =
        CredentialStore::connect(&config.metadata_url, config.metadata_max_connections, codec)
            .await?;
    store.ensure_schema().await?;

    let pool_options = config.pool_options();
    let inspector = SchemaInspector::new(pool_options.statement_timeout);
    let registry = PoolRegistry::new(PgConnector::new(pool_options), config.registry_options());
    info!(
        max_pools = config.max_pools,
        pool_size = config.pool_size,
        max_overflow = config.max_overflow,
        "Pool registry ready"
    );

    let service = SchemaService::new(store, registry, inspector);
    let transport = HttpTransport::new(service, &config.host, config.port);

    if let Err(e) = transport.run().await {
        error!(error = %e, transport = transport.name(), "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
