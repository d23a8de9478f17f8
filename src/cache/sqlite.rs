use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::str::FromStr;

use super::{title_case, CacheError, HISTORY_WINDOW_HOURS};
use crate::models::{CityInfo, Reading};

/// Durable cache backend on SQLite.
///
/// Readings are stored as JSON payloads next to their fetch time; TTL and
/// the history window are enforced by timestamp comparison in the queries,
/// and history rows past the window are deleted on every write.
pub struct SqliteStore {
    pool: SqlitePool,
    ttl_hours: i64,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, ttl_hours: i64) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(CacheError::Database)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let store = Self { pool, ttl_hours };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS latest_readings (
                station_id TEXT PRIMARY KEY,
                fetched_at TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reading_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                station_id TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS city_stations (
                city_key TEXT PRIMARY KEY,
                station_id TEXT NOT NULL,
                station_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_station_time
             ON reading_history(station_id, fetched_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn put_reading(&self, station_id: &str, reading: &Reading) -> Result<(), CacheError> {
        self.put_reading_at(station_id, reading, Utc::now()).await
    }

    async fn put_reading_at(
        &self,
        station_id: &str,
        reading: &Reading,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(reading)?;

        sqlx::query(
            r#"
            INSERT INTO latest_readings (station_id, fetched_at, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT(station_id) DO UPDATE SET
                fetched_at = excluded.fetched_at,
                payload = excluded.payload
            "#,
        )
        .bind(station_id)
        .bind(fetched_at)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO reading_history (station_id, fetched_at, payload) VALUES ($1, $2, $3)",
        )
        .bind(station_id)
        .bind(fetched_at)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        let cutoff = fetched_at - Duration::hours(HISTORY_WINDOW_HOURS);
        sqlx::query("DELETE FROM reading_history WHERE station_id = $1 AND fetched_at < $2")
            .bind(station_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn latest(&self, station_id: &str) -> Result<Option<Reading>, CacheError> {
        let expiry = Utc::now() - Duration::hours(self.ttl_hours);

        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM latest_readings WHERE station_id = $1 AND fetched_at > $2",
        )
        .bind(station_id)
        .bind(expiry)
        .fetch_optional(&self.pool)
        .await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn history(
        &self,
        station_id: &str,
        window_hours: i64,
    ) -> Result<Vec<Reading>, CacheError> {
        let cutoff = Utc::now() - Duration::hours(window_hours);

        let rows = sqlx::query(
            r#"
            SELECT payload FROM reading_history
            WHERE station_id = $1 AND fetched_at >= $2
            ORDER BY fetched_at DESC
            "#,
        )
        .bind(station_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut readings = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            match serde_json::from_str(&payload) {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    tracing::warn!("Skipping undecodable history row for {}: {}", station_id, e)
                }
            }
        }

        Ok(readings)
    }

    pub async fn set_city_station(
        &self,
        city: &str,
        station_id: &str,
        station_name: &str,
    ) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO city_stations (city_key, station_id, station_name)
            VALUES ($1, $2, $3)
            ON CONFLICT(city_key) DO UPDATE SET
                station_id = excluded.station_id,
                station_name = excluded.station_name
            "#,
        )
        .bind(city.to_lowercase())
        .bind(station_id)
        .bind(station_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn station_for_city(&self, city: &str) -> Result<Option<String>, CacheError> {
        let station_id: Option<String> =
            sqlx::query_scalar("SELECT station_id FROM city_stations WHERE city_key = $1")
                .bind(city.to_lowercase())
                .fetch_optional(&self.pool)
                .await?;

        Ok(station_id)
    }

    pub async fn all_cities(&self) -> Result<Vec<CityInfo>, CacheError> {
        let rows = sqlx::query("SELECT city_key, station_id, station_name FROM city_stations")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let city_key: String = row.get("city_key");
                CityInfo {
                    city: title_case(&city_key),
                    station_id: Some(row.get("station_id")),
                    station_name: Some(row.get("station_name")),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::reading;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 48).await.unwrap()
    }

    #[tokio::test]
    async fn put_then_latest_round_trips() {
        let store = store().await;
        let written = reading("Boston", 57);

        store.put_reading("3030", &written).await.unwrap();
        assert_eq!(store.latest("3030").await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn latest_is_overwritten_not_merged() {
        let store = store().await;
        store.put_reading("3030", &reading("Boston", 10)).await.unwrap();
        store.put_reading("3030", &reading("Boston", 99)).await.unwrap();

        assert_eq!(store.latest("3030").await.unwrap().unwrap().aqi, 99);
        // Both writes remain in history though.
        assert_eq!(store.history("3030", 48).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expired_latest_is_absent() {
        let store = store().await;
        let old = Utc::now() - Duration::hours(49);
        store
            .put_reading_at("3030", &reading("Boston", 57), old)
            .await
            .unwrap();

        assert_eq!(store.latest("3030").await.unwrap(), None);
    }

    #[tokio::test]
    async fn history_window_excludes_old_entries() {
        let store = store().await;
        let now = Utc::now();
        store
            .put_reading_at("3030", &reading("Boston", 30), now - Duration::hours(30))
            .await
            .unwrap();
        store
            .put_reading_at("3030", &reading("Boston", 10), now - Duration::hours(10))
            .await
            .unwrap();

        let last_day = store.history("3030", 24).await.unwrap();
        assert_eq!(last_day.len(), 1);
        assert_eq!(last_day[0].aqi, 10);

        let full_window = store.history("3030", 48).await.unwrap();
        assert_eq!(full_window.len(), 2);
        // Most recent first.
        assert_eq!(full_window[0].aqi, 10);
    }

    #[tokio::test]
    async fn writes_prune_history_past_the_window() {
        let store = store().await;
        let now = Utc::now();
        store
            .put_reading_at("3030", &reading("Boston", 1), now - Duration::hours(60))
            .await
            .unwrap();
        store
            .put_reading_at("3030", &reading("Boston", 2), now)
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reading_history")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn city_mapping_is_case_insensitive_and_idempotent() {
        let store = store().await;
        store.set_city_station("Boston", "123", "Old Name").await.unwrap();
        store.set_city_station("BOSTON", "123", "Boston Station").await.unwrap();

        assert_eq!(
            store.station_for_city("boston").await.unwrap(),
            Some("123".to_string())
        );
        assert_eq!(
            store.station_for_city("BOSTON").await.unwrap(),
            Some("123".to_string())
        );

        let cities = store.all_cities().await.unwrap();
        assert_eq!(cities.len(), 1);
        assert_eq!(cities[0].station_name.as_deref(), Some("Boston Station"));
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}/cache.db", dir.path().display());

        {
            let store = SqliteStore::connect(&url, 48).await.unwrap();
            store.put_reading("3030", &reading("Boston", 57)).await.unwrap();
            store.set_city_station("Boston", "3030", "Back Bay").await.unwrap();
        }

        let store = SqliteStore::connect(&url, 48).await.unwrap();
        assert_eq!(store.latest("3030").await.unwrap().unwrap().aqi, 57);
        assert_eq!(
            store.station_for_city("boston").await.unwrap(),
            Some("3030".to_string())
        );
    }
}
