use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    cache::CacheStore,
    models::{CityInfo, Reading},
    scheduler::UpdateCoordinator,
    waqi::WaqiClient,
};

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheStore>,
    pub coordinator: Arc<UpdateCoordinator>,
    pub waqi_client: Arc<WaqiClient>,
}

// Request/Response types
#[derive(Debug, Deserialize)]
pub struct AirQualityQuery {
    pub city: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub city: String,
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct CityListResponse {
    pub cities: Vec<CityInfo>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub city: String,
    pub station_id: String,
    pub hours: i64,
    pub data_points: usize,
    pub history: Vec<Reading>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_cities: usize,
    pub total_stations: usize,
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,
    pub next_update: Option<chrono::DateTime<chrono::Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub cache_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RawStationResponse {
    pub station_id: String,
    pub raw_response: serde_json::Value,
}

// Route handlers
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "Air Quality Monitoring API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// List all monitored cities. An empty list means discovery has not run
/// yet, which is a temporary condition rather than a valid empty result.
pub async fn get_cities(
    State(state): State<AppState>,
) -> Result<Json<CityListResponse>, StatusCode> {
    let cities = state.cache.all_cities().await;

    if cities.is_empty() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let count = cities.len();
    Ok(Json(CityListResponse { cities, count }))
}

/// Latest reading for a city. On a cache miss, one immediate fetch is
/// attempted before giving up.
pub async fn get_air_quality(
    State(state): State<AppState>,
    Query(params): Query<AirQualityQuery>,
) -> Result<Json<Reading>, StatusCode> {
    let Some(station_id) = state.cache.station_for_city(&params.city).await else {
        return Err(StatusCode::NOT_FOUND);
    };

    if let Some(reading) = state.cache.latest(&station_id).await {
        return Ok(Json(reading));
    }

    tracing::info!("Cache miss for {}, fetching immediately...", params.city);
    match state.coordinator.fetch_station(&station_id, &params.city).await {
        Some(reading) => Ok(Json(reading)),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// Latest reading for a station id. No lazy fetch here: a station that is
/// not in the cache is simply not found.
pub async fn get_station_reading(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
) -> Result<Json<Reading>, StatusCode> {
    match state.cache.latest(&station_id).await {
        Some(reading) => Ok(Json(reading)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let hours = params.hours.unwrap_or(24).clamp(1, 48);

    let Some(station_id) = state.cache.station_for_city(&params.city).await else {
        return Err(StatusCode::NOT_FOUND);
    };

    let history = state.cache.history(&station_id, hours).await;

    Ok(Json(HistoryResponse {
        city: params.city,
        station_id,
        hours,
        data_points: history.len(),
        history,
    }))
}

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let cities = state.cache.all_cities().await;
    let stats = state.coordinator.stats_snapshot().await;

    let mut station_ids: Vec<&String> =
        cities.iter().filter_map(|c| c.station_id.as_ref()).collect();
    station_ids.sort();
    station_ids.dedup();

    Json(StatsResponse {
        total_cities: cities.len(),
        total_stations: station_ids.len(),
        last_update: stats.last_update,
        next_update: stats.next_update,
        success_count: stats.success_count,
        error_count: stats.error_count,
        cache_type: state.cache.backend_name(),
    })
}

/// Raw provider payload passthrough, for debugging station feeds.
pub async fn get_raw_station(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
) -> Result<Json<RawStationResponse>, StatusCode> {
    match state.waqi_client.station_feed_raw(&station_id).await {
        Ok(Some(raw_response)) => Ok(Json(RawStationResponse {
            station_id,
            raw_response,
        })),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Error fetching raw station data: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// Create the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/api/cities", get(get_cities))
        .route("/api/airquality", get(get_air_quality))
        .route("/api/station/:station_id", get(get_station_reading))
        .route("/api/history", get(get_history))
        .route("/api/stats", get(get_stats))
        .route("/api/debug/raw/:station_id", get(get_raw_station))
        .with_state(state)
}
