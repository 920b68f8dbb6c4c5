//! Data types of the deviation report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::VehicleFailure;
use crate::report::grade::Grade;

/// Deviation statistics for one vehicle over every analyzed day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleSummary {
    pub vehicle_id: String,
    pub days: usize,
    pub windows: usize,
    pub matched_windows: usize,
    pub unmatched_windows: usize,
    /// Mean of the matched windows' mean deviations, in meters; `None` when
    /// no window matched.
    pub mean_deviation_m: Option<f64>,
    pub stddev_deviation_m: Option<f64>,
    /// Fraction of matched windows whose mean deviation is within tolerance.
    pub on_route_share: f64,
    pub grade: Grade,
    /// Most frequently matched branch and direction.
    pub branch: Option<String>,
    pub direction: Option<String>,
}

/// Complete report, written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct DeviationReport {
    pub schema_version: u8,
    pub generated_at: DateTime<Utc>,
    pub route_id: Option<String>,
    pub window_minutes: i64,
    pub on_route_tolerance_m: f64,
    pub vehicles: Vec<VehicleSummary>,
    pub failures: Vec<VehicleFailure>,
}

/// Summary entry for the vehicle index listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportIndexEntry {
    pub vehicle_id: String,
    pub grade: Grade,
    pub on_route_share: f64,
    pub mean_deviation_m: Option<f64>,
}

/// Top-level index of every vehicle in a report, sorted by vehicle.
#[derive(Debug, Clone, Serialize)]
pub struct ReportIndex {
    pub generated_at: DateTime<Utc>,
    pub vehicles: Vec<ReportIndexEntry>,
}

impl DeviationReport {
    pub fn index(&self) -> ReportIndex {
        ReportIndex {
            generated_at: self.generated_at,
            vehicles: self
                .vehicles
                .iter()
                .map(|v| ReportIndexEntry {
                    vehicle_id: v.vehicle_id.clone(),
                    grade: v.grade,
                    on_route_share: v.on_route_share,
                    mean_deviation_m: v.mean_deviation_m,
                })
                .collect(),
        }
    }
}
