//! Optional thinning of a single vehicle-day trace before grouping.
//!
//! Parked buses report the same corner over and over, and cheap AVL units
//! jitter between neighbouring fixes. Both passes keep record order intact.

use std::collections::HashMap;

use chrono::Duration;
use geo::algorithm::Distance;
use geo::{Euclidean, Point};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::record::GpsRecord;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    pub enabled: bool,
    /// Decimal places coordinates are rounded to before collapsing.
    pub rounding_precision: u32,
    /// Length of the time slices inside which rounded duplicates collapse.
    pub interval_secs: i64,
    /// How many following fixes the look-ahead pass considers.
    pub check_ahead: usize,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rounding_precision: 4,
            interval_secs: 120,
            check_ahead: 3,
        }
    }
}

impl DenoiseConfig {
    /// The grouping slice length.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] unless `interval_secs` is a positive,
    /// representable number of seconds.
    pub fn interval(&self) -> Result<Duration> {
        Duration::try_seconds(self.interval_secs)
            .filter(|d| *d > Duration::zero())
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "denoise interval must be positive, got {} s",
                    self.interval_secs
                ))
            })
    }
}

/// Runs both passes when enabled; otherwise returns the records unchanged.
pub fn denoise(records: Vec<GpsRecord>, config: &DenoiseConfig) -> Result<Vec<GpsRecord>> {
    if !config.enabled {
        return Ok(records);
    }
    let grouped = group_within_intervals(&records, config.rounding_precision, config.interval()?);
    Ok(closest_points(&grouped, config.check_ahead))
}

/// Collapses fixes that round to the same coordinate inside each time slice.
///
/// A slice starts at the first record not yet consumed and spans every
/// following record up to `start + interval` inclusive. Within a slice the
/// first fix of each rounded coordinate survives and absorbs the weight of
/// the others. A slice always holds at least its first record, so a
/// non-positive interval degrades to one slice per record. Expects records
/// of one vehicle in time order.
pub fn group_within_intervals(
    records: &[GpsRecord],
    precision: u32,
    interval: Duration,
) -> Vec<GpsRecord> {
    let scale = 10f64.powi(precision as i32);
    let key = |r: &GpsRecord| {
        (
            (r.latitude * scale).round() as i64,
            (r.longitude * scale).round() as i64,
        )
    };

    let mut out: Vec<GpsRecord> = Vec::with_capacity(records.len());
    let mut start = 0;

    while start < records.len() {
        let end_time = records[start].timestamp + interval;
        let end = records[start..]
            .iter()
            .position(|r| r.timestamp > end_time)
            .map_or(records.len(), |offset| start + offset)
            .max(start + 1);

        let mut seen: HashMap<(i64, i64), usize> = HashMap::new();
        for record in &records[start..end] {
            match seen.get(&key(record)) {
                Some(&idx) => out[idx].weight += record.weight,
                None => {
                    seen.insert(key(record), out.len());
                    out.push(record.clone());
                }
            }
        }

        start = end;
    }

    out
}

/// Walks the trace keeping, at each step, the nearest of the next
/// `check_ahead` fixes. The first fix is always kept; ties go to the
/// earliest candidate.
pub fn closest_points(records: &[GpsRecord], check_ahead: usize) -> Vec<GpsRecord> {
    if records.is_empty() || check_ahead == 0 {
        return records.to_vec();
    }

    let mut kept = vec![records[0].clone()];
    let mut i = 0;

    while i < records.len() - 1 {
        let here = records[i].point();
        let window_end = (i + 1 + check_ahead).min(records.len());

        let mut best = i + 1;
        let mut best_dist = f64::INFINITY;
        for (j, candidate) in records.iter().enumerate().take(window_end).skip(i + 1) {
            let d = Euclidean.distance(Point::from(here), Point::from(candidate.point()));
            if d < best_dist {
                best_dist = d;
                best = j;
            }
        }

        kept.push(records[best].clone());
        i = best;
    }

    kept
}
