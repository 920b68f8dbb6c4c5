//! Readers turning raw AVL exports into [`GpsRecord`]s.
//!
//! Two sources are supported: CSV exports with configurable column names, and
//! protobuf GTFS Realtime VehiclePositions snapshots.

use std::io::Read;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use prost::Message;
use tracing::{debug, warn};

use crate::config::CsvColumns;
use crate::gtfs_rt::FeedMessage;
use crate::record::GpsRecord;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Extracts one record per vehicle position in `feed`.
///
/// The plate is the license plate when present, else the vehicle label, the
/// vehicle id, and finally the entity id. Positions without a timestamp fall
/// back to the header timestamp and are skipped if neither is set.
pub fn records_from_feed(
    feed: &FeedMessage,
    route_filter: Option<&str>,
    offset: &FixedOffset,
) -> Vec<GpsRecord> {
    let header_ts = feed.header.timestamp;
    let mut records = Vec::new();

    for entity in &feed.entity {
        if entity.is_deleted == Some(true) {
            continue;
        }
        let Some(vp) = &entity.vehicle else {
            continue;
        };
        let Some(pos) = &vp.position else {
            continue;
        };

        if let Some(route) = route_filter {
            let route_id = vp.trip.as_ref().and_then(|t| t.route_id.as_deref());
            if route_id != Some(route) {
                continue;
            }
        }

        let Some(epoch) = vp.timestamp.or(header_ts) else {
            debug!(entity_id = %entity.id, "Vehicle position without timestamp");
            continue;
        };
        let Some(utc) = DateTime::from_timestamp(epoch as i64, 0) else {
            continue;
        };

        let descriptor = vp.vehicle.as_ref();
        let plate = descriptor
            .and_then(|v| v.license_plate.as_deref())
            .or_else(|| descriptor.and_then(|v| v.label.as_deref()))
            .or_else(|| descriptor.and_then(|v| v.id.as_deref()))
            .filter(|s| !s.is_empty())
            .unwrap_or(&entity.id);

        records.push(GpsRecord::new(
            plate,
            utc.with_timezone(offset).naive_local(),
            f64::from(pos.latitude),
            f64::from(pos.longitude),
        ));
    }

    records
}

/// Parses timestamps as written by the AVL exports: local date-times in a
/// few layouts, RFC 3339 (converted to `offset`), or epoch seconds.
pub fn parse_timestamp(raw: &str, offset: &FixedOffset) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(offset).naive_local());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|utc| utc.with_timezone(offset).naive_local())
}

/// Parses a combined `"lat, lon"` coordinate cell.
pub fn parse_coordinates(raw: &str) -> Option<(f64, f64)> {
    let (lat, lon) = raw.split_once(',')?;
    Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}

/// Reads GPS records from a CSV with the given column layout.
///
/// Rows that cannot be parsed are skipped and counted; coordinate validity
/// is left to the cleaner.
///
/// # Errors
///
/// Fails if a configured column is missing from the header or the CSV itself
/// is malformed.
pub fn read_csv_records<R: Read>(
    reader: R,
    columns: &CsvColumns,
    route_filter: Option<&str>,
    offset: &FixedOffset,
) -> Result<Vec<GpsRecord>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| anyhow!("column '{name}' not found in CSV header"))
    };

    let plate_idx = column(&columns.plate)?;
    let ts_idx = column(&columns.timestamp)?;
    let coord_idx = match &columns.coordinates {
        Some(name) => CoordColumns::Combined(column(name)?),
        None => CoordColumns::Split(column(&columns.latitude)?, column(&columns.longitude)?),
    };
    let route_idx = match (&columns.route, route_filter) {
        (Some(name), Some(_)) => Some(column(name)?),
        _ => None,
    };
    let weight_idx = column(&columns.weight).ok();

    let mut records = Vec::new();
    let mut skipped = 0usize;

    for (line, row) in rdr.records().enumerate() {
        let row = row.with_context(|| format!("reading CSV row {}", line + 2))?;

        if let (Some(idx), Some(route)) = (route_idx, route_filter) {
            if row.get(idx).map(str::trim) != Some(route) {
                continue;
            }
        }

        let parsed = (|| {
            let plate = row.get(plate_idx)?.trim();
            let timestamp = parse_timestamp(row.get(ts_idx)?, offset)?;
            let (lat, lon): (f64, f64) = match coord_idx {
                CoordColumns::Combined(idx) => parse_coordinates(row.get(idx)?)?,
                CoordColumns::Split(lat_idx, lon_idx) => (
                    row.get(lat_idx)?.trim().parse().ok()?,
                    row.get(lon_idx)?.trim().parse().ok()?,
                ),
            };
            let weight = match weight_idx {
                Some(idx) => row.get(idx)?.trim().parse().ok()?,
                None => 1,
            };
            Some(GpsRecord {
                weight,
                ..GpsRecord::new(plate, timestamp, lat, lon)
            })
        })();

        match parsed {
            Some(record) if !record.vehicle_id.is_empty() => records.push(record),
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(skipped, kept = records.len(), "Skipped unparsable CSV rows");
    }
    Ok(records)
}

#[derive(Clone, Copy)]
enum CoordColumns {
    Combined(usize),
    Split(usize, usize),
}
