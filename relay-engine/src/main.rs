use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::notify::BroadcastNotifier;
use crate::repository::{MemoryRunStore, PgRunStore, RunStore};
use crate::service::RunService;

pub mod api;
pub mod config;
pub mod db;
pub mod notify;
pub mod repository;
pub mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Relay run engine...");

    let config = Config::from_env()?;
    config.validate()?;

    let store: Arc<dyn RunStore> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(database_url, &config).await?;
            db::run_migrations(&pool).await?;

            tracing::info!("Database connection pool created");
            Arc::new(PgRunStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, run state is kept in memory only");
            Arc::new(MemoryRunStore::new())
        }
    };

    let notifier = Arc::new(BroadcastNotifier::new(config.event_buffer));
    let service = Arc::new(RunService::new(store, notifier));

    // Build router with all API endpoints
    let app = api::create_router(service);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
