use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::models::CityConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub waqi_token: String,
    pub waqi_base_url: String,
    pub database_url: String,
    pub cache_ttl_hours: i64,
    pub cities_file: String,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            waqi_token: env::var("WAQI_TOKEN")
                .map_err(|_| anyhow::anyhow!("WAQI_TOKEN not set"))?,
            waqi_base_url: env::var("WAQI_BASE_URL")
                .unwrap_or_else(|_| "https://api.waqi.info".to_string()),
            database_url: env::var("DATABASE_URL").unwrap_or_default(),
            cache_ttl_hours: env::var("CACHE_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(48),
            cities_file: env::var("CITIES_FILE").unwrap_or_else(|_| "cities.json".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
        })
    }
}

/// Load the monitored city list from the configured JSON file.
///
/// A missing or malformed file is reported as an error; the caller decides
/// whether to treat an empty city list as fatal.
pub fn load_cities(path: impl AsRef<Path>) -> anyhow::Result<Vec<CityConfig>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    let cities: Vec<CityConfig> = serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
    Ok(cities)
}
