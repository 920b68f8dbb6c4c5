use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::geometry::GeoPoint;

/// One GPS fix reported by a bus.
///
/// `timestamp` is local wall-clock time (the AVL exports carry no zone).
/// `weight` counts how many raw fixes this record stands for once nearby
/// duplicates have been collapsed; raw records have weight 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsRecord {
    #[serde(rename = "plate")]
    pub vehicle_id: String,
    pub timestamp: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "unit_weight")]
    pub weight: u32,
}

fn unit_weight() -> u32 {
    1
}

impl GpsRecord {
    pub fn new(
        vehicle_id: impl Into<String>,
        timestamp: NaiveDateTime,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            timestamp,
            latitude,
            longitude,
            weight: 1,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}
