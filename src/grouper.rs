//! Buckets cleaned records into per-vehicle, per-day time windows.
//!
//! Window `k` of a day covers `(k·w, (k+1)·w]` measured from midnight, with
//! midnight itself in window 0. A fix stamped exactly on a boundary therefore
//! belongs to the window that ends there.

use std::iter::Peekable;
use std::vec::IntoIter;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::record::GpsRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub vehicle_id: String,
    pub date: NaiveDate,
    pub window_index: u32,
}

/// Time-ordered fixes of one vehicle inside one window.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSegment {
    pub key: WindowKey,
    pub records: Vec<GpsRecord>,
}

/// Index of the window containing `timestamp`.
pub fn window_index(timestamp: NaiveDateTime, window: Duration) -> u32 {
    let time = timestamp.time();
    // chrono encodes a leap second as nanosecond >= 1e9; fold it into :59.
    let nanos = i64::from(time.nanosecond().min(999_999_999));
    let offset = i64::from(time.num_seconds_from_midnight()) * 1_000_000_000 + nanos;

    let width = window.num_nanoseconds().unwrap_or(i64::MAX).max(1);
    if offset == 0 {
        0
    } else {
        ((offset - 1) / width) as u32
    }
}

/// Sorts `records` by vehicle then time and yields one [`TraceSegment`] per
/// non-empty window, lazily.
///
/// # Errors
///
/// Returns [`PipelineError::Validation`] if `window` is not positive.
pub fn group_windows(mut records: Vec<GpsRecord>, window: Duration) -> Result<WindowGroups> {
    if window <= Duration::zero() {
        return Err(PipelineError::validation(format!(
            "window size must be positive, got {}s",
            window.num_seconds()
        )));
    }

    records.sort_by(|a, b| {
        a.vehicle_id
            .cmp(&b.vehicle_id)
            .then(a.timestamp.cmp(&b.timestamp))
    });

    Ok(WindowGroups {
        records: records.into_iter().peekable(),
        window,
    })
}

pub struct WindowGroups {
    records: Peekable<IntoIter<GpsRecord>>,
    window: Duration,
}

fn key_of(record: &GpsRecord, window: Duration) -> WindowKey {
    WindowKey {
        vehicle_id: record.vehicle_id.clone(),
        date: record.date(),
        window_index: window_index(record.timestamp, window),
    }
}

impl Iterator for WindowGroups {
    type Item = TraceSegment;

    fn next(&mut self) -> Option<TraceSegment> {
        let window = self.window;
        let first = self.records.next()?;
        let key = key_of(&first, window);
        let mut records = vec![first];

        while let Some(next) = self.records.peek() {
            if key_of(next, window) != key {
                break;
            }
            if let Some(record) = self.records.next() {
                records.push(record);
            }
        }

        Some(TraceSegment { key, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 9, 12)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn rec(plate: &str, t: NaiveDateTime) -> GpsRecord {
        GpsRecord::new(plate, t, 19.43, -99.13)
    }

    #[test]
    fn test_boundary_record_falls_into_earlier_window() {
        let five = Duration::minutes(5);

        assert_eq!(window_index(at(7, 4, 59), five), 84);
        assert_eq!(window_index(at(7, 5, 0), five), 84);
        assert_eq!(window_index(at(7, 5, 1), five), 85);
        assert_eq!(window_index(at(0, 0, 0), five), 0);
        assert_eq!(window_index(at(0, 5, 0), five), 0);
        assert_eq!(window_index(at(0, 5, 1), five), 1);
    }

    #[test]
    fn test_groups_by_vehicle_date_and_window() {
        let records = vec![
            rec("B", at(7, 1, 0)),
            rec("A", at(7, 6, 0)),
            rec("A", at(7, 1, 0)),
            rec("A", at(7, 5, 0)),
            rec("A", at(7, 2, 0)),
        ];

        let groups: Vec<_> = group_windows(records, Duration::minutes(5))
            .unwrap()
            .collect();

        assert_eq!(groups.len(), 3);

        assert_eq!(groups[0].key.vehicle_id, "A");
        assert_eq!(groups[0].key.window_index, 84);
        let times: Vec<_> = groups[0].records.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![at(7, 1, 0), at(7, 2, 0), at(7, 5, 0)]);

        assert_eq!(groups[1].key.vehicle_id, "A");
        assert_eq!(groups[1].key.window_index, 85);
        assert_eq!(groups[1].records.len(), 1);

        assert_eq!(groups[2].key.vehicle_id, "B");
    }

    #[test]
    fn test_same_window_on_different_days_is_split() {
        let day2 = NaiveDate::from_ymd_opt(2023, 9, 13)
            .unwrap()
            .and_hms_opt(7, 1, 0)
            .unwrap();
        let records = vec![rec("A", at(7, 1, 0)), rec("A", day2)];

        let groups: Vec<_> = group_windows(records, Duration::minutes(5))
            .unwrap()
            .collect();

        assert_eq!(groups.len(), 2);
        assert_ne!(groups[0].key.date, groups[1].key.date);
    }

    #[test]
    fn test_non_positive_window_is_rejected() {
        let err = group_windows(vec![rec("A", at(7, 0, 0))], Duration::zero())
            .err()
            .unwrap();
        assert!(err.is_validation());
    }

    #[test]
    fn test_empty_input_yields_no_groups() {
        let mut groups = group_windows(Vec::new(), Duration::minutes(5)).unwrap();
        assert!(groups.next().is_none());
    }
}
