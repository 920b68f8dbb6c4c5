use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use crate::config::AnalysisConfig;
use crate::output::PredictionRow;
use crate::pipeline::VehicleFailure;
use crate::report::grade::Grade;
use crate::report::types::{DeviationReport, VehicleSummary};
use crate::report::utility::{mean, share_within, stddev};
use crate::routes::VariantKey;

/// Builds the report from prediction rows, one summary per plate.
pub fn build_report(
    rows: &[PredictionRow],
    config: &AnalysisConfig,
    failures: Vec<VehicleFailure>,
) -> DeviationReport {
    let mut by_vehicle: BTreeMap<&str, Vec<&PredictionRow>> = BTreeMap::new();
    for row in rows {
        by_vehicle.entry(row.plate.as_str()).or_default().push(row);
    }

    let vehicles = by_vehicle
        .into_iter()
        .map(|(plate, rows)| summarize_vehicle(plate, &rows, config.on_route_tolerance_m))
        .collect();

    DeviationReport {
        schema_version: 1,
        generated_at: Utc::now(),
        route_id: config.route.clone(),
        window_minutes: config.window_minutes,
        on_route_tolerance_m: config.on_route_tolerance_m,
        vehicles,
        failures,
    }
}

fn summarize_vehicle(plate: &str, rows: &[&PredictionRow], tolerance_m: f64) -> VehicleSummary {
    let days: BTreeSet<_> = rows.iter().map(|r| r.date).collect();

    let mut deviations = Vec::new();
    let mut variant_counts: BTreeMap<VariantKey, usize> = BTreeMap::new();

    for row in rows {
        let (Some(branch), Some(direction), Some(deviation)) =
            (&row.branch, &row.direction, row.mean_deviation)
        else {
            continue;
        };
        deviations.push(deviation);
        *variant_counts
            .entry(VariantKey::new(branch.clone(), direction.clone()))
            .or_default() += 1;
    }

    let avg = (!deviations.is_empty()).then(|| mean(&deviations));
    let share = share_within(&deviations, tolerance_m);
    // Equal counts go to the lowest variant key.
    let usual = variant_counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(key, _)| key);

    VehicleSummary {
        vehicle_id: plate.to_string(),
        days: days.len(),
        windows: rows.len(),
        matched_windows: deviations.len(),
        unmatched_windows: rows.len() - deviations.len(),
        mean_deviation_m: avg,
        stddev_deviation_m: avg.map(|m| stddev(&deviations, m)),
        on_route_share: share,
        grade: Grade::from_share(share),
        branch: usual.as_ref().map(|k| k.branch_id.clone()),
        direction: usual.map(|k| k.direction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(plate: &str, day: u32, branch: Option<&str>, deviation: Option<f64>) -> PredictionRow {
        PredictionRow {
            plate: plate.to_string(),
            date: NaiveDate::from_ymd_opt(2023, 9, day).unwrap(),
            window: 84,
            branch: branch.map(str::to_string),
            direction: branch.map(|_| "ida".to_string()),
            mean_deviation: deviation,
            points: 10,
            matched_points: if deviation.is_some() { 10 } else { 0 },
        }
    }

    #[test]
    fn test_vehicle_summary() {
        let rows = vec![
            row("0050034", 12, Some("1"), Some(10.0)),
            row("0050034", 12, Some("1"), Some(30.0)),
            row("0050034", 13, Some("2"), Some(200.0)),
            row("0050034", 13, None, None),
            row("0050035", 12, Some("2"), Some(5.0)),
        ];

        let report = build_report(&rows, &AnalysisConfig::default(), Vec::new());

        assert_eq!(report.vehicles.len(), 2);
        let bus = &report.vehicles[0];
        assert_eq!(bus.vehicle_id, "0050034");
        assert_eq!(bus.days, 2);
        assert_eq!(bus.windows, 4);
        assert_eq!(bus.matched_windows, 3);
        assert_eq!(bus.unmatched_windows, 1);
        assert_eq!(bus.mean_deviation_m, Some(80.0));
        assert!((bus.on_route_share - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(bus.grade, Grade::C);
        assert_eq!(bus.branch.as_deref(), Some("1"));
        assert_eq!(bus.direction.as_deref(), Some("ida"));

        assert_eq!(report.vehicles[1].grade, Grade::APlus);
    }

    #[test]
    fn test_never_matched_vehicle_gets_f() {
        let rows = vec![row("0050034", 12, None, None)];
        let report = build_report(&rows, &AnalysisConfig::default(), Vec::new());

        let bus = &report.vehicles[0];
        assert_eq!(bus.matched_windows, 0);
        assert_eq!(bus.grade, Grade::F);
        assert_eq!(bus.branch, None);
        assert_eq!(bus.mean_deviation_m, None);
        assert_eq!(bus.stddev_deviation_m, None);

        let json = serde_json::to_value(report.index()).unwrap();
        assert!(json["vehicles"][0]["mean_deviation_m"].is_null());
    }

    #[test]
    fn test_equal_counts_pick_lowest_branch() {
        let rows = vec![
            row("0050034", 12, Some("10"), Some(1.0)),
            row("0050034", 12, Some("2"), Some(1.0)),
        ];
        let report = build_report(&rows, &AnalysisConfig::default(), Vec::new());
        assert_eq!(report.vehicles[0].branch.as_deref(), Some("2"));
    }

    #[test]
    fn test_index_lists_every_vehicle() {
        let rows = vec![
            row("0050035", 12, Some("1"), Some(1.0)),
            row("0050034", 12, Some("1"), Some(100.0)),
        ];
        let index = build_report(&rows, &AnalysisConfig::default(), Vec::new()).index();
        let plates: Vec<_> = index.vehicles.iter().map(|v| v.vehicle_id.as_str()).collect();
        assert_eq!(plates, vec!["0050034", "0050035"]);
        assert_eq!(index.vehicles[0].grade, Grade::F);
    }
}
