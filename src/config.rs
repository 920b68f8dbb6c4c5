//! Analysis settings.
//!
//! Defaults cover the Mexico City AVL exports. A JSON file can override any
//! subset of fields, and CLI flags override the file:
//! ```json
//! {
//!   "columns": { "plate": "busPlate: Descending", "timestamp": "receivedtime: Descending",
//!                "coordinates": "Coordenadas: Descending", "route": "routeID: Descending" },
//!   "route": "RUTA 5",
//!   "start_time": "2023-09-12T05:00:00",
//!   "end_time": "2023-09-12T23:00:00",
//!   "window_minutes": 5,
//!   "matcher": { "max_search_radius_m": 300.0 },
//!   "denoise": { "enabled": true }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{Duration, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::cleaner::CleanRules;
use crate::denoise::DenoiseConfig;
use crate::error::PipelineError;
use crate::geometry::BoundingBox;
use crate::matcher::MatcherConfig;

/// Column names of the raw GPS CSV.
///
/// When `coordinates` is set, latitude and longitude are read from that
/// single `"lat, lon"` column instead. The defaults match the CSV the
/// `clean` command writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvColumns {
    pub plate: String,
    pub latitude: String,
    pub longitude: String,
    pub timestamp: String,
    /// Read when present; rows without it count as one fix.
    pub weight: String,
    pub coordinates: Option<String>,
    pub route: Option<String>,
}

impl Default for CsvColumns {
    fn default() -> Self {
        Self {
            plate: "plate".to_string(),
            latitude: "latitude".to_string(),
            longitude: "longitude".to_string(),
            timestamp: "timestamp".to_string(),
            weight: "weight".to_string(),
            coordinates: None,
            route: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub columns: CsvColumns,
    /// Keep only rows whose route column equals this value.
    pub route: Option<String>,
    /// Keep only this vehicle.
    pub plate: Option<String>,
    /// Inclusive local-time range of records to keep.
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub bounding_box: BoundingBox,
    /// Offset applied to epoch timestamps (GTFS-RT) to get local time.
    pub utc_offset_hours: i32,
    pub window_minutes: i64,
    pub matcher: MatcherConfig,
    pub denoise: DenoiseConfig,
    /// Window mean deviation at or below which a bus counts as on route.
    pub on_route_tolerance_m: f64,
    pub concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            columns: CsvColumns::default(),
            route: None,
            plate: None,
            start_time: None,
            end_time: None,
            bounding_box: BoundingBox::MEXICO_CITY,
            utc_offset_hours: -6,
            window_minutes: 5,
            matcher: MatcherConfig::default(),
            denoise: DenoiseConfig::default(),
            on_route_tolerance_m: 50.0,
            concurrency: 4,
        }
    }
}

impl AnalysisConfig {
    /// Loads settings from a JSON file; missing fields keep their defaults.
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {path}"))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// The grouping window size.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] unless `window_minutes` is positive and
    /// small enough to represent.
    pub fn window(&self) -> crate::error::Result<Duration> {
        Duration::try_minutes(self.window_minutes)
            .filter(|w| *w > Duration::zero())
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "window size must be positive, got {} minutes",
                    self.window_minutes
                ))
            })
    }

    pub fn clean_rules(&self) -> CleanRules {
        CleanRules {
            bounding_box: self.bounding_box,
            plate: self.plate.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .with_context(|| format!("invalid UTC offset {}h", self.utc_offset_hours))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = format!("{}/route_deviation_config_test.json", env::temp_dir().display());
        fs::write(
            &path,
            r#"{ "route": "RUTA 5", "matcher": { "max_search_radius_m": 300.0 } }"#,
        )
        .unwrap();

        let config = AnalysisConfig::load(&path).unwrap();

        assert_eq!(config.route.as_deref(), Some("RUTA 5"));
        assert_eq!(config.matcher.max_search_radius_m, 300.0);
        assert_eq!(
            config.matcher.tie_tolerance_m,
            MatcherConfig::default().tie_tolerance_m
        );
        assert_eq!(config.window_minutes, 5);
        assert_eq!(config.columns.plate, "plate");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_utc_offset() {
        let config = AnalysisConfig::default();
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), -6 * 3600);
    }

    #[test]
    fn test_window_rejects_non_positive_and_huge_values() {
        let mut config = AnalysisConfig::default();
        assert_eq!(config.window().unwrap(), Duration::minutes(5));

        for minutes in [0, -5, i64::MAX] {
            config.window_minutes = minutes;
            assert!(config.window().unwrap_err().is_validation(), "{minutes} minutes");
        }
    }

    #[test]
    fn test_time_range_and_plate_feed_clean_rules() {
        let config: AnalysisConfig = serde_json::from_str(
            r#"{ "plate": "0050034", "start_time": "2023-09-12T05:00:00", "end_time": "2023-09-12T23:00:00" }"#,
        )
        .unwrap();

        let rules = config.clean_rules();
        assert_eq!(rules.plate.as_deref(), Some("0050034"));
        assert_eq!(rules.start_time.unwrap().to_string(), "2023-09-12 05:00:00");
        assert_eq!(rules.end_time.unwrap().to_string(), "2023-09-12 23:00:00");
        assert_eq!(rules.bounding_box, BoundingBox::MEXICO_CITY);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AnalysisConfig::load("/nonexistent/route_deviation.json").is_err());
    }
}
