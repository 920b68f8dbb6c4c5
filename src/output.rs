//! Output persistence: predictions CSV, cleaned records and the GeoJSON map.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use geo::{MultiLineString, Point};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue, Value};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::matcher::MatchResult;
use crate::record::GpsRecord;
use crate::routes::RouteVariant;

/// One row of the predictions CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub plate: String,
    pub date: NaiveDate,
    pub window: u32,
    pub branch: Option<String>,
    pub direction: Option<String>,
    pub mean_deviation: Option<f64>,
    pub points: usize,
    pub matched_points: usize,
}

impl From<&MatchResult> for PredictionRow {
    fn from(result: &MatchResult) -> Self {
        Self {
            plate: result.vehicle_id.clone(),
            date: result.date,
            window: result.window_index,
            branch: result.branch_id.clone(),
            direction: result.direction.clone(),
            mean_deviation: result.mean_deviation,
            points: result.points.len(),
            matched_points: result.matched_points(),
        }
    }
}

/// Writes match results and route maps somewhere.
pub trait Exporter {
    fn write_csv(&self, results: &[MatchResult]) -> Result<PathBuf>;

    fn render_map(&self, results: &[MatchResult], variants: &[RouteVariant]) -> Result<PathBuf>;
}

/// Writes `predictions.csv` and `map.geojson` into a directory.
#[derive(Debug, Clone)]
pub struct FileExporter {
    output_dir: PathBuf,
}

impl FileExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        Ok(Self { output_dir })
    }
}

impl Exporter for FileExporter {
    fn write_csv(&self, results: &[MatchResult]) -> Result<PathBuf> {
        write_csv(&self.output_dir.join("predictions.csv"), results)
    }

    fn render_map(&self, results: &[MatchResult], variants: &[RouteVariant]) -> Result<PathBuf> {
        render_map(&self.output_dir.join("map.geojson"), results, variants)
    }
}

/// Writes one [`PredictionRow`] per result, replacing any existing file.
pub fn write_csv(path: &Path, results: &[MatchResult]) -> Result<PathBuf> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for result in results {
        writer.serialize(PredictionRow::from(result))?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = results.len(), "Predictions written");
    Ok(path.to_path_buf())
}

/// Writes cleaned GPS records, replacing any existing file.
pub fn write_records(path: &Path, records: &[GpsRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = records.len(), "Records written");
    Ok(())
}

/// Reads a predictions CSV back, e.g. to build a report from an earlier run.
pub fn read_predictions(path: &Path) -> Result<Vec<PredictionRow>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let rows = reader
        .deserialize()
        .collect::<std::result::Result<Vec<PredictionRow>, _>>()
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(rows)
}

/// Writes a GeoJSON FeatureCollection: one line per route variant and one
/// point per snapped trace point, carrying its deviation.
pub fn render_map(
    path: &Path,
    results: &[MatchResult],
    variants: &[RouteVariant],
) -> Result<PathBuf> {
    let mut features: Vec<Feature> = variants.iter().map(variant_feature).collect();

    for result in results {
        for (point, deviation) in result.points.iter().zip(&result.deviations) {
            let mut properties = JsonObject::new();
            properties.insert("plate".to_string(), JsonValue::from(result.vehicle_id.clone()));
            properties.insert("date".to_string(), JsonValue::from(result.date.to_string()));
            properties.insert("window".to_string(), JsonValue::from(result.window_index));
            properties.insert("branch".to_string(), JsonValue::from(result.branch_id.clone()));
            properties.insert("direction".to_string(), JsonValue::from(result.direction.clone()));
            properties.insert("deviation".to_string(), JsonValue::from(*deviation));

            features.push(feature(Value::from(&Point::from(*point)), properties));
        }
    }

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    std::fs::write(path, collection.to_string())
        .with_context(|| format!("writing {}", path.display()))?;

    info!(path = %path.display(), variants = variants.len(), "Map written");
    Ok(path.to_path_buf())
}

fn feature(value: Value, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn variant_feature(variant: &RouteVariant) -> Feature {
    let mut lines = variant.line_strings();
    let value = if lines.len() == 1 {
        Value::from(&lines.remove(0))
    } else {
        Value::from(&MultiLineString::new(lines))
    };

    let mut properties = JsonObject::new();
    properties.insert("route".to_string(), JsonValue::from(variant.route_id.clone()));
    properties.insert("branch".to_string(), JsonValue::from(variant.branch_id.clone()));
    properties.insert("direction".to_string(), JsonValue::from(variant.direction.clone()));

    feature(value, properties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CsvColumns;
    use crate::geometry::GeoPoint;
    use crate::parser::read_csv_records;
    use geojson::GeoJson;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    fn result(window: u32, matched: bool) -> MatchResult {
        MatchResult {
            vehicle_id: "0050034".to_string(),
            date: NaiveDate::from_ymd_opt(2023, 9, 12).unwrap(),
            window_index: window,
            branch_id: matched.then(|| "1".to_string()),
            direction: matched.then(|| "ida".to_string()),
            mean_deviation: matched.then_some(12.5),
            deviations: vec![matched.then_some(12.5), None],
            points: vec![GeoPoint::new(19.43, -99.13), GeoPoint::new(19.44, -99.12)],
        }
    }

    #[test]
    fn test_write_csv_header_and_rows() {
        let path = temp_path("route_deviation_test_predictions.csv");
        let _ = fs::remove_file(&path);

        write_csv(&path, &[result(84, true), result(85, false)]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(
            lines[0],
            "plate,date,window,branch,direction,mean_deviation,points,matched_points"
        );
        assert_eq!(lines[1], "0050034,2023-09-12,84,1,ida,12.5,2,1");
        assert_eq!(lines[2], "0050034,2023-09-12,85,,,,2,0");

        let rows = read_predictions(&path).unwrap();
        assert_eq!(rows[1].branch, None);
        assert_eq!(rows[0], PredictionRow::from(&result(84, true)));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_render_map_features() {
        let dir = temp_path("route_deviation_test_map");
        let exporter = FileExporter::new(&dir).unwrap();
        let variants = vec![
            RouteVariant::new(
                "RUTA 5",
                "1",
                "ida",
                vec![GeoPoint::new(19.43, -99.13), GeoPoint::new(19.44, -99.12)],
            ),
            RouteVariant::new(
                "RUTA 5",
                "2",
                "ida",
                vec![
                    GeoPoint::new(19.43, -99.13),
                    GeoPoint::new(19.44, -99.12),
                    GeoPoint::new(19.45, -99.11),
                ],
            )
            .with_gaps(vec![2]),
        ];

        let path = exporter.render_map(&[result(84, true)], &variants).unwrap();

        let map = match fs::read_to_string(&path).unwrap().parse::<GeoJson>().unwrap() {
            GeoJson::FeatureCollection(collection) => collection,
            other => panic!("expected a feature collection, got {other:?}"),
        };
        let features = &map.features;
        assert_eq!(features.len(), 4);

        let geometry = |i: usize| &features[i].geometry.as_ref().unwrap().value;
        match geometry(0) {
            Value::LineString(coords) => assert_eq!(coords[0], vec![-99.13, 19.43]),
            other => panic!("expected a line string, got {other:?}"),
        }
        match geometry(1) {
            // The lone point after the gap is drawn as a zero-length line.
            Value::MultiLineString(lines) => {
                assert_eq!(lines.len(), 2);
                assert_eq!(lines[1].len(), 2);
            }
            other => panic!("expected a multi line string, got {other:?}"),
        }
        assert_eq!(*geometry(2), Value::Point(vec![-99.13, 19.43]));
        assert_eq!(features[2].property("deviation"), Some(&JsonValue::from(12.5)));
        assert_eq!(features[3].property("deviation"), Some(&JsonValue::Null));
        assert_eq!(features[3].property("plate"), Some(&JsonValue::from("0050034")));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_records_roundtrip_columns() {
        let path = temp_path("route_deviation_test_records.csv");
        let ts = NaiveDate::from_ymd_opt(2023, 9, 12)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        let record = GpsRecord {
            weight: 3,
            ..GpsRecord::new("0050034", ts, 19.43, -99.13)
        };
        write_records(&path, std::slice::from_ref(&record)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("plate,timestamp,latitude,longitude,weight\n"));

        // The default column layout reads it back, weight included.
        let offset = chrono::FixedOffset::east_opt(-6 * 3600).unwrap();
        let read =
            read_csv_records(content.as_bytes(), &CsvColumns::default(), None, &offset).unwrap();
        assert_eq!(read, vec![record]);

        fs::remove_file(&path).unwrap();
    }
}
