use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasend_server::config::Config;
use wasend_server::db::Database;
use wasend_server::quota::MemoryQuotaCache;
use wasend_server::routes;
use wasend_server::state::{AppState, Collaborators};
use wasend_server::storage::FileStorage;
use wasend_server::transport::BridgeConnector;

const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wasend_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Starting wasend server on {}:{}", config.server.host, config.server.port);

    // Initialize database
    let db = Arc::new(Database::new(&config.database.path).await?);
    db.run_migrations().await?;

    let connector = BridgeConnector::new(
        &config.bridge.url,
        Duration::from_secs(config.bridge.request_timeout_secs),
    );
    let parts = Collaborators {
        devices: db.clone(),
        subscriptions: db.clone(),
        logs: db,
        credentials: Arc::new(FileStorage::new(&config.storage.sessions_dir)),
        cache: Arc::new(MemoryQuotaCache::new()),
        connector: Arc::new(connector),
    };

    let (state, worker) = AppState::new(config.clone(), parts);
    state.dispatcher.spawn_worker(worker);

    // Reopen every device that was connected before the restart
    if let Err(e) = state.sessions.restore_all().await {
        tracing::error!("Failed to restore sessions: {}", e);
    }

    let limiter = state.limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BUCKET_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = limiter.evict_idle();
            if evicted > 0 {
                tracing::debug!("Evicted {} idle rate limit buckets", evicted);
            }
        }
    });

    // Build router
    let app = routes::create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
