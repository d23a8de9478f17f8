//! Periodic update coordination.
//!
//! The coordinator owns the monitored city list, discovers each city's
//! nearest station once at startup, then refreshes every mapped station on
//! an hourly cadence. Failures are isolated per city: a city that cannot be
//! discovered or fetched is logged and counted, never allowed to abort the
//! rest of a pass.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::cache::CacheStore;
use crate::models::{CityConfig, Reading};
use crate::waqi::{normalize, ReadingSource};

const UPDATE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Counters and markers from the most recent fetch pass, read by the
/// stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateStats {
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
}

pub struct UpdateCoordinator {
    source: Arc<dyn ReadingSource>,
    cache: Arc<CacheStore>,
    cities: RwLock<Vec<CityConfig>>,
    stats: RwLock<UpdateStats>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateCoordinator {
    pub fn new(source: Arc<dyn ReadingSource>, cache: Arc<CacheStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            source,
            cache,
            cities: RwLock::new(Vec::new()),
            stats: RwLock::new(UpdateStats::default()),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Adopt the configured city list, discover stations, and run one full
    /// fetch pass so the cache is populated before the service reports
    /// ready. Per-city failures are logged and skipped, never fatal.
    pub async fn initialize(&self, cities: Vec<CityConfig>) {
        tracing::info!("Initializing coordinator with {} cities", cities.len());
        *self.cities.write().await = cities;

        self.discover_stations().await;
        self.fetch_all_stations().await;

        tracing::info!("Coordinator initialized");
    }

    /// Resolve each configured city's coordinates to its nearest station
    /// and record the mapping. One city's failure never blocks the others.
    pub async fn discover_stations(&self) {
        tracing::info!("Discovering stations for cities...");
        let count = self.cities.read().await.len();

        for index in 0..count {
            let (city, lat, lon) = {
                let cities = self.cities.read().await;
                let c = &cities[index];
                (c.city.clone(), c.lat, c.lon)
            };

            match self.source.nearest_station(lat, lon).await {
                Ok(Some(meta)) => {
                    {
                        let mut cities = self.cities.write().await;
                        cities[index].station_id = Some(meta.station_id.clone());
                        cities[index].station_name = Some(meta.station_name.clone());
                    }
                    self.cache
                        .set_city_station(&city, &meta.station_id, &meta.station_name)
                        .await;
                    tracing::info!(
                        "Found station for {}: {} (ID: {})",
                        city,
                        meta.station_name,
                        meta.station_id
                    );
                }
                Ok(None) => tracing::warn!("No station found for {}", city),
                Err(e) => tracing::error!("Error discovering station for {}: {}", city, e),
            }
        }
    }

    /// One full fetch pass over every station-mapped city, in configuration
    /// order. Records the pass start, per-city success/error counts, and
    /// the next scheduled time (pass start + 1 hour, wall clock).
    pub async fn fetch_all_stations(&self) {
        tracing::info!("Fetching data for all stations...");
        let start = Utc::now();
        self.stats.write().await.last_update = Some(start);

        let snapshot = self.cities.read().await.clone();
        let mut success_count: u64 = 0;
        let mut error_count: u64 = 0;

        for city in &snapshot {
            let Some(station_id) = &city.station_id else {
                tracing::warn!("Skipping {} - no station ID", city.city);
                continue;
            };

            match self.fetch_and_cache(station_id, &city.city).await {
                Some(reading) => {
                    success_count += 1;
                    tracing::info!("Updated data for {} (AQI: {})", city.city, reading.aqi);
                }
                None => error_count += 1,
            }
        }

        tracing::info!(
            "Update complete: {} successful, {} errors",
            success_count,
            error_count
        );

        let mut stats = self.stats.write().await;
        stats.success_count = success_count;
        stats.error_count = error_count;
        stats.next_update = Some(start + Duration::hours(1));
    }

    /// Fetch and cache a single station outside the periodic cycle. Used
    /// to satisfy a cache miss on read; `None` on any failure.
    pub async fn fetch_station(&self, station_id: &str, city: &str) -> Option<Reading> {
        let reading = self.fetch_and_cache(station_id, city).await;
        if reading.is_some() {
            tracing::info!("Fetched and cached data for {} (station {})", city, station_id);
        }
        reading
    }

    async fn fetch_and_cache(&self, station_id: &str, city: &str) -> Option<Reading> {
        match self.source.station_feed(station_id).await {
            Ok(Some(raw)) => {
                let reading = normalize(&raw, city);
                if !self.cache.put_reading(station_id, &reading).await {
                    // Cache write failure is non-fatal; the reading is
                    // still usable by the caller.
                    tracing::warn!("Cache write failed for {} (station {})", city, station_id);
                }
                Some(reading)
            }
            Ok(None) => {
                tracing::error!("Failed to fetch data for {}", city);
                None
            }
            Err(e) => {
                tracing::error!("Error fetching station {} for {}: {}", station_id, city, e);
                None
            }
        }
    }

    /// Arm the hourly refresh task. The first tick fires one interval after
    /// start; `initialize` has already run the initial pass.
    pub async fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let first_tick = tokio::time::Instant::now() + UPDATE_INTERVAL;
            let mut interval = tokio::time::interval_at(first_tick, UPDATE_INTERVAL);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        coordinator.fetch_all_stations().await;
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Update task received shutdown signal");
                        break;
                    }
                }
            }
        });

        *self.task.lock().await = Some(handle);
        tracing::info!("Coordinator started - updates will run every hour");
    }

    /// Disarm the refresh task. A pass already in flight is allowed to
    /// finish; once this returns no further pass can fire.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Update task did not shut down cleanly: {}", e);
            }
        }
        tracing::info!("Coordinator stopped");
    }

    pub async fn stats_snapshot(&self) -> UpdateStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::waqi::{RawFeed, StationMeta, WaqiError};
    use serde_json::json;
    use std::collections::HashMap;

    /// Stub source: stations keyed by "lat,lon", feeds keyed by station id.
    /// Anything not programmed behaves as a provider failure.
    struct StubSource {
        stations: HashMap<String, StationMeta>,
        feeds: HashMap<String, RawFeed>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                stations: HashMap::new(),
                feeds: HashMap::new(),
            }
        }

        fn with_station(mut self, lat: f64, lon: f64, id: &str, name: &str) -> Self {
            self.stations.insert(
                format!("{},{}", lat, lon),
                StationMeta {
                    station_id: id.to_string(),
                    station_name: name.to_string(),
                },
            );
            self
        }

        fn with_feed(mut self, id: &str, aqi: i64) -> Self {
            let feed: RawFeed = serde_json::from_value(json!({
                "idx": id.parse::<i64>().unwrap(),
                "aqi": aqi,
                "dominentpol": "pm25",
                "city": {"name": format!("Station {}", id)},
                "time": {"iso": "2024-03-15T10:00:00-04:00"},
                "iaqi": {"pm25": {"v": aqi as f64}}
            }))
            .unwrap();
            self.feeds.insert(id.to_string(), feed);
            self
        }
    }

    #[async_trait::async_trait]
    impl ReadingSource for StubSource {
        async fn nearest_station(
            &self,
            lat: f64,
            lon: f64,
        ) -> Result<Option<StationMeta>, WaqiError> {
            Ok(self.stations.get(&format!("{},{}", lat, lon)).cloned())
        }

        async fn station_feed(&self, station_id: &str) -> Result<Option<RawFeed>, WaqiError> {
            match self.feeds.get(station_id) {
                Some(feed) => Ok(Some(feed.clone())),
                None => Err(WaqiError::ApiError("HTTP 500: upstream down".to_string())),
            }
        }
    }

    fn city(name: &str, lat: f64, lon: f64) -> CityConfig {
        CityConfig {
            city: name.to_string(),
            lat,
            lon,
            station_id: None,
            station_name: None,
        }
    }

    fn coordinator(source: StubSource) -> (Arc<UpdateCoordinator>, Arc<CacheStore>) {
        let cache = Arc::new(CacheStore::Memory(MemoryStore::new(48)));
        let coordinator = Arc::new(UpdateCoordinator::new(Arc::new(source), Arc::clone(&cache)));
        (coordinator, cache)
    }

    #[tokio::test]
    async fn partial_pass_counts_successes_and_errors() {
        let mut source = StubSource::new();
        for i in 1..=5 {
            source = source.with_station(i as f64, 0.0, &i.to_string(), "S");
        }
        // Only three of the five stations have a working feed.
        source = source.with_feed("1", 10).with_feed("2", 20).with_feed("3", 30);

        let (coordinator, cache) = coordinator(source);
        let cities = (1..=5).map(|i| city(&format!("City{}", i), i as f64, 0.0)).collect();
        coordinator.initialize(cities).await;

        let stats = coordinator.stats_snapshot().await;
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.error_count, 2);

        assert_eq!(cache.latest("1").await.unwrap().aqi, 10);
        assert_eq!(cache.latest("3").await.unwrap().aqi, 30);
        assert!(cache.latest("4").await.is_none());
    }

    #[tokio::test]
    async fn discovery_failure_leaves_city_unmapped_and_skipped() {
        let source = StubSource::new()
            .with_station(1.0, 0.0, "1", "S1")
            .with_feed("1", 10);

        let (coordinator, cache) = coordinator(source);
        coordinator
            .initialize(vec![city("Boston", 1.0, 0.0), city("Atlantis", 9.0, 9.0)])
            .await;

        assert_eq!(cache.all_cities().await.len(), 1);
        assert_eq!(cache.station_for_city("boston").await.unwrap(), "1");
        assert!(cache.station_for_city("atlantis").await.is_none());

        // The unmapped city is skipped, not counted as an error.
        let stats = coordinator.stats_snapshot().await;
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 0);
    }

    #[tokio::test]
    async fn normalized_city_name_wins_over_provider_label() {
        let source = StubSource::new()
            .with_station(1.0, 0.0, "7", "Back Bay, Boston")
            .with_feed("7", 42);

        let (coordinator, cache) = coordinator(source);
        coordinator.initialize(vec![city("Boston", 1.0, 0.0)]).await;

        let reading = cache.latest("7").await.unwrap();
        assert_eq!(reading.city, "Boston");
        assert_eq!(reading.station, "Station 7");
    }

    #[tokio::test]
    async fn failed_miss_fill_leaves_no_cache_entry() {
        let (coordinator, cache) = coordinator(StubSource::new());

        assert!(coordinator.fetch_station("404", "Boston").await.is_none());
        assert!(cache.latest("404").await.is_none());
        assert!(cache.history("404", 48).await.is_empty());
    }

    #[tokio::test]
    async fn successful_miss_fill_caches_the_reading() {
        let source = StubSource::new().with_feed("7", 55);
        let (coordinator, cache) = coordinator(source);

        let reading = coordinator.fetch_station("7", "Boston").await.unwrap();
        assert_eq!(reading.aqi, 55);
        assert_eq!(cache.latest("7").await.unwrap(), reading);
    }

    #[tokio::test]
    async fn next_update_is_pass_start_plus_one_hour() {
        let source = StubSource::new().with_station(1.0, 0.0, "1", "S").with_feed("1", 10);
        let (coordinator, _cache) = coordinator(source);
        coordinator.initialize(vec![city("Boston", 1.0, 0.0)]).await;

        let stats = coordinator.stats_snapshot().await;
        let last = stats.last_update.unwrap();
        assert_eq!(stats.next_update.unwrap(), last + Duration::hours(1));
    }

    #[tokio::test]
    async fn stop_prevents_further_passes() {
        let (coordinator, _cache) = coordinator(StubSource::new());
        coordinator.start().await;
        coordinator.stop().await;
        // Stopping again is harmless.
        coordinator.stop().await;
        assert!(coordinator.task.lock().await.is_none());
    }
}
