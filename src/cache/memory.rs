use chrono::{DateTime, Duration, Utc};
use moka::future::Cache as MokaCache;
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

use super::{title_case, HISTORY_WINDOW_HOURS};
use crate::models::{CityInfo, Reading};

/// In-process fallback backend.
///
/// Latest readings live in a moka cache whose time-to-live mirrors the
/// configured TTL; history and city mappings live behind RwLocks with
/// explicit timestamp comparison for window pruning.
pub struct MemoryStore {
    latest: MokaCache<String, Reading>,
    history: RwLock<HashMap<String, Vec<(DateTime<Utc>, Reading)>>>,
    mappings: RwLock<HashMap<String, (String, String)>>,
}

impl MemoryStore {
    pub fn new(ttl_hours: i64) -> Self {
        let latest = MokaCache::builder()
            .max_capacity(10_000)
            .time_to_live(StdDuration::from_secs(ttl_hours.max(1) as u64 * 3600))
            .build();

        Self {
            latest,
            history: RwLock::new(HashMap::new()),
            mappings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn put_reading(&self, station_id: &str, reading: &Reading) {
        self.put_reading_at(station_id, reading, Utc::now()).await;
    }

    async fn put_reading_at(
        &self,
        station_id: &str,
        reading: &Reading,
        fetched_at: DateTime<Utc>,
    ) {
        self.latest
            .insert(station_id.to_string(), reading.clone())
            .await;

        let cutoff = fetched_at - Duration::hours(HISTORY_WINDOW_HOURS);
        let mut history = self.history.write().await;
        let entries = history.entry(station_id.to_string()).or_default();
        entries.push((fetched_at, reading.clone()));
        entries.retain(|(ts, _)| *ts > cutoff);
    }

    pub async fn latest(&self, station_id: &str) -> Option<Reading> {
        self.latest.get(station_id).await
    }

    pub async fn history(&self, station_id: &str, window_hours: i64) -> Vec<Reading> {
        let cutoff = Utc::now() - Duration::hours(window_hours);
        let history = self.history.read().await;

        let Some(entries) = history.get(station_id) else {
            return Vec::new();
        };

        let mut within: Vec<&(DateTime<Utc>, Reading)> =
            entries.iter().filter(|(ts, _)| *ts >= cutoff).collect();
        within.sort_by(|a, b| b.0.cmp(&a.0));
        within.into_iter().map(|(_, r)| r.clone()).collect()
    }

    pub async fn set_city_station(&self, city: &str, station_id: &str, station_name: &str) {
        self.mappings.write().await.insert(
            city.to_lowercase(),
            (station_id.to_string(), station_name.to_string()),
        );
    }

    pub async fn station_for_city(&self, city: &str) -> Option<String> {
        self.mappings
            .read()
            .await
            .get(&city.to_lowercase())
            .map(|(id, _)| id.clone())
    }

    pub async fn all_cities(&self) -> Vec<CityInfo> {
        self.mappings
            .read()
            .await
            .iter()
            .map(|(key, (station_id, station_name))| CityInfo {
                city: title_case(key),
                station_id: Some(station_id.clone()),
                station_name: Some(station_name.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::reading;

    #[tokio::test]
    async fn put_then_latest_round_trips() {
        let store = MemoryStore::new(48);
        let written = reading("Boston", 57);

        store.put_reading("3030", &written).await;
        assert_eq!(store.latest("3030").await, Some(written));
        assert_eq!(store.latest("999").await, None);
    }

    #[tokio::test]
    async fn latest_is_overwritten_not_merged() {
        let store = MemoryStore::new(48);
        store.put_reading("3030", &reading("Boston", 10)).await;
        store.put_reading("3030", &reading("Boston", 99)).await;

        assert_eq!(store.latest("3030").await.unwrap().aqi, 99);
        assert_eq!(store.history("3030", 48).await.len(), 2);
    }

    #[tokio::test]
    async fn history_window_excludes_old_entries() {
        let store = MemoryStore::new(48);
        let now = Utc::now();
        store
            .put_reading_at("3030", &reading("Boston", 30), now - Duration::hours(30))
            .await;
        store
            .put_reading_at("3030", &reading("Boston", 10), now - Duration::hours(10))
            .await;

        let last_day = store.history("3030", 24).await;
        assert_eq!(last_day.len(), 1);
        assert_eq!(last_day[0].aqi, 10);

        let full_window = store.history("3030", 48).await;
        assert_eq!(full_window.len(), 2);
        assert_eq!(full_window[0].aqi, 10);
    }

    #[tokio::test]
    async fn writes_prune_history_past_the_window() {
        let store = MemoryStore::new(48);
        let now = Utc::now();
        store
            .put_reading_at("3030", &reading("Boston", 1), now - Duration::hours(60))
            .await;
        store
            .put_reading_at("3030", &reading("Boston", 2), now)
            .await;

        assert_eq!(store.history.read().await["3030"].len(), 1);
    }

    #[tokio::test]
    async fn city_mapping_is_case_insensitive_and_idempotent() {
        let store = MemoryStore::new(48);
        store.set_city_station("Boston", "123", "Old Name").await;
        store.set_city_station("BOSTON", "123", "Boston Station").await;

        assert_eq!(
            store.station_for_city("boston").await,
            Some("123".to_string())
        );
        assert_eq!(
            store.station_for_city("BOSTON").await,
            Some("123".to_string())
        );

        let cities = store.all_cities().await;
        assert_eq!(cities.len(), 1);
        assert_eq!(cities[0].station_name.as_deref(), Some("Boston Station"));
    }

    #[tokio::test]
    async fn distinct_stations_do_not_interfere() {
        let store = MemoryStore::new(48);
        store.put_reading("1", &reading("Boston", 11)).await;
        store.put_reading("2", &reading("Denver", 22)).await;

        assert_eq!(store.latest("1").await.unwrap().aqi, 11);
        assert_eq!(store.latest("2").await.unwrap().aqi, 22);
        assert_eq!(store.history("1", 48).await.len(), 1);
    }
}
