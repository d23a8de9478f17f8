use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::Config;
use crate::models::{ForecastDay, Pollutants, Reading, Weather};

/// Pollutants the provider publishes daily forecasts for.
const FORECAST_POLLUTANTS: [&str; 4] = ["pm25", "pm10", "o3", "uvi"];

#[derive(Error, Debug)]
pub enum WaqiError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    JsonParsing(#[from] serde_json::Error),
    #[error("Rate limited, retry after: {0}s")]
    RateLimited(u64),
    #[error("API error: {0}")]
    ApiError(String),
}

/// The nearest monitoring station for a coordinate pair.
#[derive(Debug, Clone)]
pub struct StationMeta {
    pub station_id: String,
    pub station_name: String,
}

// Raw WAQI feed payload. Fields default rather than fail: stations report
// wildly different subsets, and a thin payload is still a usable reading.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFeed {
    #[serde(default)]
    pub idx: Option<i64>,
    #[serde(default)]
    pub aqi: Value,
    #[serde(default, rename = "dominentpol")]
    pub dominant: String,
    #[serde(default)]
    pub city: RawCity,
    #[serde(default)]
    pub time: RawTime,
    #[serde(default)]
    pub iaqi: HashMap<String, RawMetric>,
    #[serde(default)]
    pub forecast: RawForecast,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCity {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTime {
    #[serde(default)]
    pub iso: String,
}

/// WAQI wraps every scalar measurement as `{"v": <number>}`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RawMetric {
    #[serde(default)]
    pub v: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawForecast {
    #[serde(default)]
    pub daily: HashMap<String, Vec<Value>>,
}

/// Provider-facing surface the update coordinator depends on. Implemented
/// by [`WaqiClient`] in production and by stub sources in tests.
#[async_trait::async_trait]
pub trait ReadingSource: Send + Sync {
    async fn nearest_station(&self, lat: f64, lon: f64)
        -> Result<Option<StationMeta>, WaqiError>;

    async fn station_feed(&self, station_id: &str) -> Result<Option<RawFeed>, WaqiError>;
}

#[async_trait::async_trait]
impl ReadingSource for WaqiClient {
    async fn nearest_station(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<Option<StationMeta>, WaqiError> {
        WaqiClient::nearest_station(self, lat, lon).await
    }

    async fn station_feed(&self, station_id: &str) -> Result<Option<RawFeed>, WaqiError> {
        WaqiClient::station_feed(self, station_id).await
    }
}

pub struct WaqiClient {
    client: Client,
    config: Config,
}

impl WaqiClient {
    pub fn new(config: Config) -> Self {
        let client = Client::builder()
            .user_agent("AirwatchServer/1.0")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    /// Find the nearest monitoring station for the given coordinates.
    ///
    /// Returns `Ok(None)` when the provider has no station to offer (or
    /// answers with a non-"ok" status payload).
    pub async fn nearest_station(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<Option<StationMeta>, WaqiError> {
        let url = format!("{}/feed/geo:{};{}/", self.config.waqi_base_url, lat, lon);

        let Some(data) = self.feed_request(&url).await? else {
            return Ok(None);
        };

        let feed: RawFeed = serde_json::from_value(data)?;
        let Some(idx) = feed.idx else {
            return Ok(None);
        };

        Ok(Some(StationMeta {
            station_id: idx.to_string(),
            station_name: feed.city.name,
        }))
    }

    /// Fetch the current feed for a station, parsed into the raw shape.
    pub async fn station_feed(&self, station_id: &str) -> Result<Option<RawFeed>, WaqiError> {
        match self.station_feed_raw(station_id).await? {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// Fetch the current feed for a station as an unparsed JSON value.
    /// Used by the debug passthrough endpoint.
    pub async fn station_feed_raw(&self, station_id: &str) -> Result<Option<Value>, WaqiError> {
        let url = format!("{}/feed/@{}/", self.config.waqi_base_url, station_id);
        self.feed_request(&url).await
    }

    /// Issue a feed request and unwrap the WAQI envelope.
    ///
    /// The envelope is `{"status": "ok", "data": ...}`; any other status
    /// means the provider declined the request and we return `None`.
    async fn feed_request(&self, url: &str) -> Result<Option<Value>, WaqiError> {
        let body = self
            .make_request_with_retry(url, &[("token", self.config.waqi_token.as_str())])
            .await?;

        let status = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if status != "ok" {
            tracing::error!(
                "WAQI API returned status {:?}: {}",
                status,
                body.get("data").cloned().unwrap_or_default()
            );
            return Ok(None);
        }

        Ok(body.get("data").cloned())
    }

    async fn make_request_with_retry(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, WaqiError> {
        let mut retry_count = 0;
        let max_retries = 3;
        let mut delay = Duration::from_millis(1000);

        loop {
            let response = self.client.get(url).query(params).send().await?;

            match response.status() {
                reqwest::StatusCode::OK => {
                    let json: Value = response.json().await?;
                    return Ok(json);
                }
                reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    if retry_count >= max_retries {
                        return Err(WaqiError::RateLimited(delay.as_secs()));
                    }

                    tracing::warn!(
                        "Rate limited by WAQI API, retrying in {}ms",
                        delay.as_millis()
                    );

                    sleep(delay).await;
                    delay = delay.mul_f32(2.0 + fastrand::f32() * 0.5); // Exponential backoff with jitter
                    retry_count += 1;
                }
                status => {
                    let error_text = response.text().await.unwrap_or_default();
                    return Err(WaqiError::ApiError(format!(
                        "HTTP {}: {}",
                        status, error_text
                    )));
                }
            }
        }
    }
}

/// Convert a raw feed into a normalized [`Reading`].
///
/// `city` is the configured city name and always wins over the provider's
/// own station-city label. Unparseable forecast entries are skipped
/// individually rather than discarding the whole reading.
pub fn normalize(raw: &RawFeed, city: &str) -> Reading {
    let pollutants = Pollutants {
        pm25: metric(&raw.iaqi, "pm25"),
        pm10: metric(&raw.iaqi, "pm10"),
        no2: metric(&raw.iaqi, "no2"),
        o3: metric(&raw.iaqi, "o3"),
        so2: metric(&raw.iaqi, "so2"),
        co: metric(&raw.iaqi, "co"),
    };

    let weather = Weather {
        temperature: metric(&raw.iaqi, "t"),
        humidity: metric(&raw.iaqi, "h"),
        wind: metric(&raw.iaqi, "w"),
        pressure: metric(&raw.iaqi, "p"),
    };

    Reading {
        city: city.to_string(),
        station: raw.city.name.clone(),
        timestamp: raw.time.iso.clone(),
        // Idle stations report aqi as "-"; treat anything non-numeric as 0.
        aqi: raw.aqi.as_i64().unwrap_or(0),
        dominant: raw.dominant.clone(),
        pollutants,
        weather,
        forecast: parse_forecast(&raw.forecast),
    }
}

fn metric(iaqi: &HashMap<String, RawMetric>, key: &str) -> Option<f64> {
    iaqi.get(key).and_then(|m| m.v)
}

fn parse_forecast(forecast: &RawForecast) -> HashMap<String, Vec<ForecastDay>> {
    let mut result = HashMap::new();

    for pollutant in FORECAST_POLLUTANTS {
        let Some(items) = forecast.daily.get(pollutant) else {
            continue;
        };

        let days: Vec<ForecastDay> = items
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(day) => Some(day),
                Err(e) => {
                    tracing::warn!("Skipping malformed forecast entry for {}: {}", pollutant, e);
                    None
                }
            })
            .collect();

        if !days.is_empty() {
            result.insert(pollutant.to_string(), days);
        }
    }

    result
}
