//! Batch driver: clean, group, snap and match every vehicle's trace.
//!
//! Vehicles are independent, so each one runs in its own tokio task, bounded
//! by a semaphore. The matcher index, snapper and settings are shared through
//! `Arc`. A vehicle that fails is logged and reported; the rest continue.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info};

use crate::cleaner::clean;
use crate::config::AnalysisConfig;
use crate::denoise::denoise;
use crate::error::{PipelineError, Result};
use crate::geometry::GeoPoint;
use crate::grouper::group_windows;
use crate::matcher::{MatchResult, RouteMatcher};
use crate::record::GpsRecord;
use crate::routes::VariantKey;
use crate::snapper::{Snapper, snap_all};
use crate::streets::StreetCounts;

/// A vehicle whose trace could not be analyzed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleFailure {
    pub vehicle_id: String,
    pub date: Option<NaiveDate>,
    pub reason: String,
}

impl VehicleFailure {
    fn new(vehicle_id: &str, err: &PipelineError) -> Self {
        let date = match err {
            PipelineError::Validation { date, .. } => *date,
            PipelineError::Input(_) => None,
        };
        Self {
            vehicle_id: vehicle_id.to_string(),
            date,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Sorted by vehicle, date and window.
    pub results: Vec<MatchResult>,
    pub streets: StreetCounts,
    pub failures: Vec<VehicleFailure>,
}

struct VehicleOutcome {
    results: Vec<MatchResult>,
    streets: StreetCounts,
}

pub struct Pipeline<S> {
    matcher: Arc<RouteMatcher>,
    snapper: Arc<S>,
    config: Arc<AnalysisConfig>,
}

impl<S: Snapper + 'static> Pipeline<S> {
    /// # Errors
    ///
    /// [`PipelineError::Validation`] if the window size or, when denoising
    /// is on, its interval is not a positive duration.
    pub fn new(matcher: RouteMatcher, snapper: S, config: AnalysisConfig) -> Result<Self> {
        config.window()?;
        if config.denoise.enabled {
            config.denoise.interval()?;
        }
        Ok(Self {
            matcher: Arc::new(matcher),
            snapper: Arc::new(snapper),
            config: Arc::new(config),
        })
    }

    pub fn matcher(&self) -> &RouteMatcher {
        &self.matcher
    }

    /// Matches every vehicle's windows against the route variants.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Input`] when there are no route variants and
    /// [`PipelineError::Validation`] when `records` is empty. Failures of
    /// single vehicles are returned in [`BatchOutcome::failures`].
    #[tracing::instrument(skip_all, fields(records = records.len()))]
    pub async fn run(&self, records: Vec<GpsRecord>) -> Result<BatchOutcome> {
        if self.matcher.is_empty() {
            return Err(PipelineError::input("no candidate route variants"));
        }
        if records.is_empty() {
            return Err(PipelineError::validation("no GPS records to analyze"));
        }

        let runs = for_each_vehicle(records, self.config.concurrency, |vehicle_id, records| {
            let matcher = self.matcher.clone();
            let snapper = self.snapper.clone();
            let config = self.config.clone();
            async move { match_vehicle(&vehicle_id, records, &matcher, &*snapper, &config).await }
        })
        .await;

        let mut outcome = BatchOutcome::default();
        for run in runs {
            match run {
                Ok(vehicle) => {
                    outcome.results.extend(vehicle.results);
                    outcome.streets.merge(vehicle.streets);
                }
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome.results.sort_by(|a, b| {
            (&a.vehicle_id, a.date, a.window_index).cmp(&(&b.vehicle_id, b.date, b.window_index))
        });

        info!(
            windows = outcome.results.len(),
            matched = outcome.results.iter().filter(|r| r.is_matched()).count(),
            failed_vehicles = outcome.failures.len(),
            "Batch matched"
        );
        Ok(outcome)
    }
}

/// Snaps every cleaned fix and counts the streets visited, without matching
/// against any route.
///
/// # Errors
///
/// [`PipelineError::Validation`] when `records` is empty.
#[tracing::instrument(skip_all, fields(records = records.len()))]
pub async fn count_streets<S: Snapper + 'static>(
    snapper: Arc<S>,
    config: Arc<AnalysisConfig>,
    records: Vec<GpsRecord>,
) -> Result<(StreetCounts, Vec<VehicleFailure>)> {
    if records.is_empty() {
        return Err(PipelineError::validation("no GPS records to analyze"));
    }

    let runs = for_each_vehicle(records, config.concurrency, |vehicle_id, records| {
        let snapper = snapper.clone();
        let config = config.clone();
        async move {
            let mut streets = StreetCounts::new();
            for (_, day) in prepare_days(&vehicle_id, records, &config)? {
                let points: Vec<GeoPoint> = day.iter().map(GpsRecord::point).collect();
                streets.record_all(&snap_all(&*snapper, &points).await);
            }
            Ok::<_, PipelineError>(streets)
        }
    })
    .await;

    let mut streets = StreetCounts::new();
    let mut failures = Vec::new();
    for run in runs {
        match run {
            Ok(counts) => streets.merge(counts),
            Err(failure) => failures.push(failure),
        }
    }
    Ok((streets, failures))
}

/// Cleans one vehicle's records and splits them into denoised days.
fn prepare_days(
    vehicle_id: &str,
    records: Vec<GpsRecord>,
    config: &AnalysisConfig,
) -> Result<BTreeMap<NaiveDate, Vec<GpsRecord>>> {
    let cleaned =
        clean(records, &config.clean_rules()).map_err(|e| e.scoped(vehicle_id, None))?;

    let mut days: BTreeMap<NaiveDate, Vec<GpsRecord>> = BTreeMap::new();
    for record in cleaned {
        days.entry(record.date()).or_default().push(record);
    }
    for (date, day) in days.iter_mut() {
        *day = denoise(std::mem::take(day), &config.denoise)
            .map_err(|e| e.scoped(vehicle_id, Some(*date)))?;
    }
    Ok(days)
}

async fn match_vehicle<S: Snapper + ?Sized>(
    vehicle_id: &str,
    records: Vec<GpsRecord>,
    matcher: &RouteMatcher,
    snapper: &S,
    config: &AnalysisConfig,
) -> Result<VehicleOutcome> {
    let mut outcome = VehicleOutcome {
        results: Vec::new(),
        streets: StreetCounts::new(),
    };

    for (date, day) in prepare_days(vehicle_id, records, config)? {
        let segments =
            group_windows(day, config.window()?).map_err(|e| e.scoped(vehicle_id, Some(date)))?;
        // Continuity only carries within a day; unmatched windows keep it.
        let mut previous: Option<VariantKey> = None;

        for segment in segments {
            let raw: Vec<GeoPoint> = segment.records.iter().map(GpsRecord::point).collect();
            let snapped = snap_all(snapper, &raw).await;
            outcome.streets.record_all(&snapped);

            let points: Vec<GeoPoint> = snapped.iter().map(|s| s.point).collect();
            let result = matcher
                .match_segment(&segment.key, &points, previous.as_ref())
                .map_err(|e| e.scoped(vehicle_id, Some(date)))?;

            if let Some(key) = result.variant_key() {
                previous = Some(key);
            }
            outcome.results.push(result);
        }
    }

    debug!(windows = outcome.results.len(), "Vehicle matched");
    Ok(outcome)
}

/// Runs `work` once per vehicle on its own task, at most `concurrency` at a
/// time, and returns the outcomes in vehicle order.
async fn for_each_vehicle<T, F, Fut>(
    records: Vec<GpsRecord>,
    concurrency: usize,
    work: F,
) -> Vec<std::result::Result<T, VehicleFailure>>
where
    T: Send + 'static,
    F: Fn(String, Vec<GpsRecord>) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let mut by_vehicle: BTreeMap<String, Vec<GpsRecord>> = BTreeMap::new();
    for record in records {
        by_vehicle
            .entry(record.vehicle_id.clone())
            .or_default()
            .push(record);
    }
    info!(vehicles = by_vehicle.len(), concurrency, "Processing vehicles");

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::with_capacity(by_vehicle.len());

    for (vehicle_id, records) in by_vehicle {
        let sem = semaphore.clone();
        let span = tracing::info_span!("process_vehicle", vehicle_id = %vehicle_id);
        let job = work(vehicle_id.clone(), records);

        let task = tokio::spawn(
            async move {
                // The semaphore is never closed, so a permit is always granted.
                let _permit = sem.acquire().await.ok();
                job.await
            }
            .instrument(span),
        );
        tasks.push((vehicle_id, task));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for (vehicle_id, task) in tasks {
        let outcome = match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(vehicle_id = %vehicle_id, error = %e, "Vehicle failed");
                Err(VehicleFailure::new(&vehicle_id, &e))
            }
            Err(e) => {
                error!(vehicle_id = %vehicle_id, error = %e, "Vehicle task aborted");
                Err(VehicleFailure {
                    vehicle_id,
                    date: None,
                    reason: e.to_string(),
                })
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}
