use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A city the service monitors. Coordinates are only used once, during
/// station discovery; `station_id`/`station_name` are filled in afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityConfig {
    pub city: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default)]
    pub station_id: Option<String>,
    #[serde(default)]
    pub station_name: Option<String>,
}

/// Individual pollutant concentrations. Stations report an arbitrary
/// subset, so every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pollutants {
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub no2: Option<f64>,
    pub o3: Option<f64>,
    pub so2: Option<f64>,
    pub co: Option<f64>,
}

/// Weather measurements reported alongside the air quality data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind: Option<f64>,
    pub pressure: Option<f64>,
}

/// One day of forecast data for a single pollutant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub day: String,
    pub avg: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
}

/// A normalized air quality snapshot for one station at one instant.
///
/// `city` always carries the configured city name, never the provider's
/// own station-city label. `timestamp` is the provider's ISO-8601 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub city: String,
    pub station: String,
    pub timestamp: String,
    pub aqi: i64,
    pub dominant: String,
    pub pollutants: Pollutants,
    pub weather: Weather,
    #[serde(default)]
    pub forecast: HashMap<String, Vec<ForecastDay>>,
}

/// A monitored city as exposed by the read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityInfo {
    pub city: String,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
}
