use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod config;
mod models;
mod routes;
mod scheduler;
mod waqi;

use cache::CacheStore;
use config::Config;
use routes::{create_router, AppState};
use scheduler::UpdateCoordinator;
use waqi::{ReadingSource, WaqiClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "airwatch_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Air Quality Monitoring Service...");

    // Load configuration
    let config = Config::from_env()?;

    // Connect the cache backend (falls back to in-memory on failure)
    let cache = Arc::new(CacheStore::connect(&config.database_url, config.cache_ttl_hours).await);

    // Initialize the provider client
    let waqi_client = Arc::new(WaqiClient::new(config.clone()));

    // Initialize and start the update coordinator
    let coordinator = Arc::new(UpdateCoordinator::new(
        waqi_client.clone() as Arc<dyn ReadingSource>,
        Arc::clone(&cache),
    ));

    let cities = match config::load_cities(&config.cities_file) {
        Ok(cities) => cities,
        Err(e) => {
            tracing::error!("Error loading cities configuration: {}", e);
            Vec::new()
        }
    };
    coordinator.initialize(cities).await;
    coordinator.start().await;

    // Create application state
    let state = AppState {
        cache,
        coordinator: Arc::clone(&coordinator),
        waqi_client,
    };

    let app = create_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server starting on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down service...");
    coordinator.stop().await;
    tracing::info!("Service stopped.");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
