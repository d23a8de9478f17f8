//! Reading cache with two interchangeable backends.
//!
//! The SQLite backend is the durable option; the in-memory backend is the
//! fallback when no database is configured or the configured one cannot be
//! reached at startup. Both hold the same three kinds of state per station:
//! the latest reading (TTL-expired), a 48-hour rolling history, and the
//! city-to-station mappings filled in during discovery.
//!
//! Backend errors never propagate to callers: writes report success as a
//! bool, reads degrade to "absent"/empty. The periodic refresh and the read
//! API both treat the cache as best-effort.

pub mod memory;
pub mod sqlite;

use thiserror::Error;

use crate::models::{CityInfo, Reading};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Rolling retention window for per-station history, independent of the
/// configured TTL on latest readings.
pub const HISTORY_WINDOW_HOURS: i64 = 48;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The cache backend chosen once at startup and injected everywhere.
pub enum CacheStore {
    Sqlite(SqliteStore),
    Memory(MemoryStore),
}

impl CacheStore {
    /// Connect to the configured backend.
    ///
    /// An empty `database_url` selects the in-memory backend directly. A
    /// configured URL that fails to connect logs a warning and falls back
    /// to the in-memory backend rather than failing startup.
    pub async fn connect(database_url: &str, ttl_hours: i64) -> Self {
        if database_url.is_empty() {
            tracing::info!("No database configured. Using in-memory cache.");
            return CacheStore::Memory(MemoryStore::new(ttl_hours));
        }

        match SqliteStore::connect(database_url, ttl_hours).await {
            Ok(store) => {
                tracing::info!("Connected to cache database at {}", database_url);
                CacheStore::Sqlite(store)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to {}: {}. Using in-memory cache.",
                    database_url,
                    e
                );
                CacheStore::Memory(MemoryStore::new(ttl_hours))
            }
        }
    }

    /// Store a reading as the station's latest and append it to history,
    /// pruning history entries older than the retention window.
    ///
    /// Returns whether the write succeeded. Failures are logged here so
    /// callers can continue a batch without handling backend errors.
    pub async fn put_reading(&self, station_id: &str, reading: &Reading) -> bool {
        let result = match self {
            CacheStore::Sqlite(store) => store.put_reading(station_id, reading).await,
            CacheStore::Memory(store) => {
                store.put_reading(station_id, reading).await;
                Ok(())
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error caching reading for station {}: {}", station_id, e);
                false
            }
        }
    }

    /// The most recent cached reading for a station, if present and not
    /// expired under the TTL policy.
    pub async fn latest(&self, station_id: &str) -> Option<Reading> {
        let result = match self {
            CacheStore::Sqlite(store) => store.latest(station_id).await,
            CacheStore::Memory(store) => Ok(store.latest(station_id).await),
        };

        result.unwrap_or_else(|e| {
            tracing::error!("Error reading latest for station {}: {}", station_id, e);
            None
        })
    }

    /// Readings for a station within the last `window_hours` hours,
    /// most-recent-first. Never fails; errors degrade to an empty list.
    pub async fn history(&self, station_id: &str, window_hours: i64) -> Vec<Reading> {
        let result = match self {
            CacheStore::Sqlite(store) => store.history(station_id, window_hours).await,
            CacheStore::Memory(store) => Ok(store.history(station_id, window_hours).await),
        };

        result.unwrap_or_else(|e| {
            tracing::error!("Error reading history for station {}: {}", station_id, e);
            Vec::new()
        })
    }

    /// Upsert the mapping from a city to its discovered station. Keyed by
    /// the lower-cased city name; idempotent.
    pub async fn set_city_station(&self, city: &str, station_id: &str, station_name: &str) {
        let result = match self {
            CacheStore::Sqlite(store) => {
                store.set_city_station(city, station_id, station_name).await
            }
            CacheStore::Memory(store) => {
                store.set_city_station(city, station_id, station_name).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!("Error setting city-station mapping for {}: {}", city, e);
        }
    }

    /// Station id for a city, looked up case-insensitively.
    pub async fn station_for_city(&self, city: &str) -> Option<String> {
        let result = match self {
            CacheStore::Sqlite(store) => store.station_for_city(city).await,
            CacheStore::Memory(store) => Ok(store.station_for_city(city).await),
        };

        result.unwrap_or_else(|e| {
            tracing::error!("Error getting station for city {}: {}", city, e);
            None
        })
    }

    /// All known city-to-station mappings, sorted ascending by city name.
    pub async fn all_cities(&self) -> Vec<CityInfo> {
        let result = match self {
            CacheStore::Sqlite(store) => store.all_cities().await,
            CacheStore::Memory(store) => Ok(store.all_cities().await),
        };

        let mut cities = result.unwrap_or_else(|e| {
            tracing::error!("Error listing cities: {}", e);
            Vec::new()
        });
        cities.sort_by(|a, b| a.city.cmp(&b.city));
        cities
    }

    /// Which backend is active, for the stats surface.
    pub fn backend_name(&self) -> &'static str {
        match self {
            CacheStore::Sqlite(_) => "sqlite",
            CacheStore::Memory(_) => "memory",
        }
    }
}

/// Display form of a stored city key: the backends only keep the
/// lower-cased key, so listings title-case it back.
pub(crate) fn title_case(key: &str) -> String {
    key.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
