use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use invitation_api::{
    app::{create_app, AppState},
    config::Config,
    jobs::{JobScheduler, PoolMetricsJob, RateLimitCleanupJob, SessionCleanupJob},
    middleware,
    services::backends,
};
use persistence::PgInvitationStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("loading configuration")?;

    middleware::logging::init_logging(&config.logging);
    middleware::init_metrics().context("installing metrics recorder")?;

    info!("Starting invitation server v{}", env!("CARGO_PKG_VERSION"));

    let pool = persistence::db::create_pool(&(&config.database).into())
        .await
        .context("connecting to the database")?;
    persistence::db::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let registry = backends::build_registry(&config.backends).context("building backend clients")?;
    let missing = registry.missing();
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|t| t.as_str()).collect();
        warn!(
            server_types = ?names,
            "No backend client for these server types; invitations targeting them are unavailable"
        );
    }

    let store = PgInvitationStore::new(pool.clone()).with_lock_wait(config.invitations.lock_wait());
    let addr = config.socket_addr()?;
    let cleanup_interval = config.invitations.session_cleanup_interval_secs;
    let state = AppState::new(config, Arc::new(store.clone()), registry);

    let mut scheduler = JobScheduler::new();
    scheduler.register(PoolMetricsJob::new(pool));
    scheduler.register(SessionCleanupJob::new(store, cleanup_interval));
    if let Some(limiter) = &state.rate_limiter {
        scheduler.register(RateLimitCleanupJob::new(Arc::clone(limiter)));
    }
    scheduler.start();

    let app = create_app(state);

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    scheduler.shutdown();
    scheduler.wait_for_shutdown(Duration::from_secs(10)).await;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
