//! tablekeeper - Main entry point.
//!
//! Builds the pool manager for the configured server, prepares the permission
//! tables in the system database and serves the HTTP API.

use std::sync::Arc;
use tablekeeper::api::{self, AppState, RouterOptions};
use tablekeeper::config::Config;
use tablekeeper::db::PoolManager;
use tablekeeper::middleware::TracingAuditHook;
use tablekeeper::models::ServerTarget;
use tablekeeper::permissions::{PermissionEngine, SqlPermissionStore};
use tablekeeper::transport::{HttpTransport, Transport};
use tracing::{error, info, warn};
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
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    let settings = config.pool_settings()?;
    let retry = config.retry_policy(&settings);
    let target = ServerTarget::new(config.server_url()?)?;

    info!(
        environment = %config.environment,
        server = %target.masked_url(),
        system_database = %config.system_database,
        bind = %config.http_bind_addr(),
        "Starting tablekeeper v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pools = Arc::new(PoolManager::new(target, settings, retry));

    let store = SqlPermissionStore::new(pools.clone(), &config.system_database);
    if let Err(e) = store.ensure_schema().await {
        error!(error = %e, database = %config.system_database, "Failed to prepare permission tables");
        pools.close_all_pools().await;
        return Err(e.into());
    }
    let engine = Arc::new(
        PermissionEngine::new(store).with_lookup_timeout(config.request_timeout_duration()),
    );

    pools.start_health_check(pools.settings().reap_interval);

    if config.trust_principal_headers {
        warn!("Trusting X-User-Id / X-User-Admin headers; only run behind an authenticating proxy");
    }

    let state = AppState {
        pools: pools.clone(),
        engine,
        request_timeout: config.request_timeout_duration(),
    };
    let app = api::router(
        state,
        RouterOptions {
            audit_hook: Arc::new(TracingAuditHook),
            trust_principal_headers: config.trust_principal_headers,
        },
    );

    let transport = HttpTransport::new(app, pools, &config.http_host, config.http_port);
    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
