//! First pass over raw AVL records: drops fixes that cannot be analyzed.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::geometry::BoundingBox;
use crate::record::GpsRecord;

/// What a record must satisfy to be kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanRules {
    pub bounding_box: BoundingBox,
    /// Keep only this vehicle.
    pub plate: Option<String>,
    /// Inclusive lower bound on the local timestamp.
    pub start_time: Option<NaiveDateTime>,
    /// Inclusive upper bound on the local timestamp.
    pub end_time: Option<NaiveDateTime>,
}

impl CleanRules {
    fn in_time_range(&self, ts: NaiveDateTime) -> bool {
        self.start_time.is_none_or(|start| ts >= start)
            && self.end_time.is_none_or(|end| ts <= end)
    }
}

/// How many records each rule removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub input: usize,
    pub kept: usize,
    pub other_plate: usize,
    pub out_of_range: usize,
    pub invalid_coordinates: usize,
    pub out_of_bounds: usize,
    pub duplicates: usize,
    pub out_of_order: usize,
}

/// Filters `records`, preserving the order of the survivors.
///
/// # Errors
///
/// Returns [`PipelineError::Validation`] if the time range is inverted or no
/// record survives.
pub fn clean(records: Vec<GpsRecord>, rules: &CleanRules) -> Result<Vec<GpsRecord>> {
    clean_with_stats(records, rules).map(|(kept, _)| kept)
}

pub fn clean_with_stats(
    records: Vec<GpsRecord>,
    rules: &CleanRules,
) -> Result<(Vec<GpsRecord>, CleanStats)> {
    if let (Some(start), Some(end)) = (rules.start_time, rules.end_time) {
        if start > end {
            return Err(PipelineError::validation(format!(
                "start time {start} is after end time {end}"
            )));
        }
    }

    let mut stats = CleanStats {
        input: records.len(),
        ..Default::default()
    };

    // Index into `kept` of the last record retained for each vehicle.
    let mut last_kept: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<GpsRecord> = Vec::with_capacity(records.len());

    for record in records {
        if rules.plate.as_ref().is_some_and(|p| *p != record.vehicle_id) {
            stats.other_plate += 1;
            continue;
        }
        if !rules.in_time_range(record.timestamp) {
            stats.out_of_range += 1;
            continue;
        }

        let point = record.point();
        if !point.is_finite() || point.is_null_island() {
            stats.invalid_coordinates += 1;
            continue;
        }
        if !rules.bounding_box.contains(&point) {
            stats.out_of_bounds += 1;
            continue;
        }

        if let Some(&idx) = last_kept.get(&record.vehicle_id) {
            let prev = &kept[idx];
            if is_duplicate(prev, &record) {
                stats.duplicates += 1;
                continue;
            }
            if record.timestamp < prev.timestamp {
                stats.out_of_order += 1;
                continue;
            }
        }

        last_kept.insert(record.vehicle_id.clone(), kept.len());
        kept.push(record);
    }

    stats.kept = kept.len();
    debug!(
        input = stats.input,
        kept = stats.kept,
        other_plate = stats.other_plate,
        out_of_range = stats.out_of_range,
        invalid_coordinates = stats.invalid_coordinates,
        out_of_bounds = stats.out_of_bounds,
        duplicates = stats.duplicates,
        out_of_order = stats.out_of_order,
        "Cleaned GPS records"
    );

    if kept.is_empty() {
        return Err(PipelineError::validation(format!(
            "no records left after cleaning ({} in input)",
            stats.input
        )));
    }

    Ok((kept, stats))
}

fn is_duplicate(prev: &GpsRecord, next: &GpsRecord) -> bool {
    prev.timestamp == next.timestamp
        && prev.latitude == next.latitude
        && prev.longitude == next.longitude
}

/// True when every vehicle's timestamps are non-decreasing in sequence order.
pub fn is_time_monotonic(records: &[GpsRecord]) -> bool {
    let mut last: HashMap<&str, NaiveDateTime> = HashMap::new();
    records.iter().all(|r| {
        let ok = last
            .get(r.vehicle_id.as_str())
            .is_none_or(|prev| *prev <= r.timestamp);
        last.insert(r.vehicle_id.as_str(), r.timestamp);
        ok
    })
}
