//! Route-variant matching.
//!
//! For every candidate variant each trace point gets a deviation: the
//! distance to the nearest point of the variant's polyline, if that lies
//! within the search radius. A variant's score is the mean over the points
//! that have one. The lowest score wins; near-ties prefer the variant the
//! same bus matched in its previous window, then the lowest branch id.

use chrono::NaiveDate;
use geo::Line;
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{PipelineError, Result};
use crate::geometry::{GeoPoint, degree_span, distance_to_line};
use crate::grouper::WindowKey;
use crate::routes::{RouteVariant, VariantKey};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Points farther than this from every edge of a variant do not count
    /// towards its score.
    pub max_search_radius_m: f64,
    /// Scores closer than this are considered tied.
    pub tie_tolerance_m: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_search_radius_m: 500.0,
            tie_tolerance_m: 0.01,
        }
    }
}

/// Outcome of matching one trace segment.
///
/// An unmatched result (bus off route or GPS dropout) has no branch,
/// direction or mean deviation, and every per-point deviation is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub vehicle_id: String,
    pub date: NaiveDate,
    pub window_index: u32,
    pub branch_id: Option<String>,
    pub direction: Option<String>,
    pub mean_deviation: Option<f64>,
    pub deviations: Vec<Option<f64>>,
    pub points: Vec<GeoPoint>,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.branch_id.is_some()
    }

    pub fn variant_key(&self) -> Option<VariantKey> {
        match (&self.branch_id, &self.direction) {
            (Some(b), Some(d)) => Some(VariantKey::new(b.clone(), d.clone())),
            _ => None,
        }
    }

    /// Number of points that had a deviation against the chosen variant.
    pub fn matched_points(&self) -> usize {
        self.deviations.iter().filter(|d| d.is_some()).count()
    }
}

/// One straight piece of a variant's line string, indexed by its extent.
struct Edge(Line<f64>);

impl RTreeObject for Edge {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        let Edge(line) = self;
        AABB::from_corners([line.start.x, line.start.y], [line.end.x, line.end.y])
    }
}

struct IndexedVariant {
    variant: RouteVariant,
    key: VariantKey,
    edges: RTree<Edge>,
}

impl IndexedVariant {
    fn new(variant: RouteVariant) -> Self {
        let edges = variant
            .line_strings()
            .iter()
            .flat_map(|piece| piece.lines())
            .map(Edge)
            .collect();
        Self {
            key: variant.key(),
            edges: RTree::bulk_load(edges),
            variant,
        }
    }

    /// The tree only prunes; the distance itself is the haversine length
    /// to the projection on each candidate line.
    fn deviation(&self, point: &GeoPoint, radius: f64) -> Option<f64> {
        let (dlat, dlon) = degree_span(point, radius);
        let search = AABB::from_corners(
            [point.longitude - dlon, point.latitude - dlat],
            [point.longitude + dlon, point.latitude + dlat],
        );

        self.edges
            .locate_in_envelope_intersecting(&search)
            .map(|Edge(line)| distance_to_line(point, line))
            .filter(|d| *d <= radius)
            .min_by(f64::total_cmp)
    }
}

struct Scored<'a> {
    candidate: &'a IndexedVariant,
    score: f64,
    deviations: Vec<Option<f64>>,
}

/// Candidate variants of one route, indexed for nearest-edge queries.
///
/// Built once and shared read-only across matching tasks.
pub struct RouteMatcher {
    variants: Vec<IndexedVariant>,
    config: MatcherConfig,
}

impl RouteMatcher {
    pub fn new(variants: Vec<RouteVariant>, config: MatcherConfig) -> Self {
        Self {
            variants: variants.into_iter().map(IndexedVariant::new).collect(),
            config,
        }
    }

    pub fn variants(&self) -> impl Iterator<Item = &RouteVariant> {
        self.variants.iter().map(|v| &v.variant)
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Matches the snapped `points` of one window against every variant.
    ///
    /// `previous` is the variant this vehicle matched in its previous window,
    /// used only to break ties.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Input`] when there are no candidate variants. An
    /// off-route segment is reported as an unmatched result instead.
    pub fn match_segment(
        &self,
        key: &WindowKey,
        points: &[GeoPoint],
        previous: Option<&VariantKey>,
    ) -> Result<MatchResult> {
        if self.variants.is_empty() {
            return Err(PipelineError::input("no candidate route variants"));
        }

        let radius = self.config.max_search_radius_m;
        let scored: Vec<Scored> = self
            .variants
            .iter()
            .filter_map(|candidate| {
                let deviations: Vec<Option<f64>> = points
                    .iter()
                    .map(|p| candidate.deviation(p, radius))
                    .collect();
                let score = mean_of_present(&deviations)?;
                trace!(
                    branch = %candidate.key.branch_id,
                    direction = %candidate.key.direction,
                    score,
                    "Scored variant"
                );
                Some(Scored {
                    candidate,
                    score,
                    deviations,
                })
            })
            .collect();

        let Some(best) = self.pick(scored, previous) else {
            return Ok(MatchResult {
                vehicle_id: key.vehicle_id.clone(),
                date: key.date,
                window_index: key.window_index,
                branch_id: None,
                direction: None,
                mean_deviation: None,
                deviations: vec![None; points.len()],
                points: points.to_vec(),
            });
        };

        Ok(MatchResult {
            vehicle_id: key.vehicle_id.clone(),
            date: key.date,
            window_index: key.window_index,
            branch_id: Some(best.candidate.variant.branch_id.clone()),
            direction: Some(best.candidate.variant.direction.clone()),
            mean_deviation: Some(best.score),
            deviations: best.deviations,
            points: points.to_vec(),
        })
    }

    fn pick<'a>(
        &self,
        scored: Vec<Scored<'a>>,
        previous: Option<&VariantKey>,
    ) -> Option<Scored<'a>> {
        let min = scored.iter().map(|s| s.score).min_by(f64::total_cmp)?;
        let cutoff = min + self.config.tie_tolerance_m;

        let mut tied: Vec<Scored<'a>> =
            scored.into_iter().filter(|s| s.score <= cutoff).collect();

        if let Some(prev) = previous {
            if let Some(pos) = tied.iter().position(|s| &s.candidate.key == prev) {
                return Some(tied.swap_remove(pos));
            }
        }

        tied.sort_by(|a, b| a.candidate.key.cmp(&b.candidate.key));
        tied.into_iter().next()
    }
}

fn mean_of_present(values: &[Option<f64>]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::METERS_PER_DEGREE;

    const LAT: f64 = 19.40;

    fn key() -> WindowKey {
        WindowKey {
            vehicle_id: "0050034".to_string(),
            date: NaiveDate::from_ymd_opt(2023, 9, 12).unwrap(),
            window_index: 84,
        }
    }

    /// Straight east-west variant along `lat`.
    fn east_west(branch: &str, lat: f64) -> RouteVariant {
        RouteVariant::new(
            "RUTA 5",
            branch,
            "ida",
            vec![GeoPoint::new(lat, -99.16), GeoPoint::new(lat, -99.12)],
        )
    }

    fn north_of(meters: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(LAT + meters / METERS_PER_DEGREE, lon)
    }

    #[test]
    fn test_empty_variant_set_is_input_error() {
        let matcher = RouteMatcher::new(Vec::new(), MatcherConfig::default());
        let err = matcher
            .match_segment(&key(), &[GeoPoint::new(LAT, -99.14)], None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
    }

    #[test]
    fn test_picks_lowest_mean_deviation() {
        let a = east_west("1", LAT);
        let b = east_west("2", LAT + 200.0 / METERS_PER_DEGREE);
        let matcher = RouteMatcher::new(vec![a, b], MatcherConfig::default());

        // Three points on A, three 20 m north of A (180 m from B).
        let points = vec![
            north_of(0.0, -99.15),
            north_of(0.0, -99.145),
            north_of(0.0, -99.14),
            north_of(20.0, -99.135),
            north_of(20.0, -99.13),
            north_of(20.0, -99.125),
        ];

        let result = matcher.match_segment(&key(), &points, None).unwrap();

        assert_eq!(result.branch_id.as_deref(), Some("1"));
        assert_eq!(result.direction.as_deref(), Some("ida"));
        let mean = result.mean_deviation.unwrap();
        assert!((mean - 10.0).abs() < 0.1, "got {mean}");
        assert_eq!(result.deviations.len(), 6);
        assert_eq!(result.matched_points(), 6);
    }

    #[test]
    fn test_uses_interpolation_not_vertices() {
        // Vertices are ~2 km from the point; the edge passes 5 m away.
        let v = east_west("1", LAT);
        let matcher = RouteMatcher::new(vec![v], MatcherConfig::default());
        let result = matcher
            .match_segment(&key(), &[north_of(5.0, -99.14)], None)
            .unwrap();
        assert!((result.mean_deviation.unwrap() - 5.0).abs() < 0.05);
    }

    #[test]
    fn test_points_outside_radius_are_excluded_from_mean() {
        let v = east_west("1", LAT);
        let config = MatcherConfig {
            max_search_radius_m: 100.0,
            ..Default::default()
        };
        let matcher = RouteMatcher::new(vec![v], config);

        let points = vec![north_of(10.0, -99.14), north_of(400.0, -99.14)];
        let result = matcher.match_segment(&key(), &points, None).unwrap();

        assert!((result.mean_deviation.unwrap() - 10.0).abs() < 0.05);
        assert!(result.deviations[0].is_some());
        assert!(result.deviations[1].is_none());
        assert_eq!(result.matched_points(), 1);
    }

    #[test]
    fn test_far_away_segment_is_unmatched_not_error() {
        let matcher = RouteMatcher::new(
            vec![east_west("1", LAT), east_west("2", LAT + 0.001)],
            MatcherConfig::default(),
        );
        let points = vec![north_of(5_000.0, -99.14), north_of(6_000.0, -99.13)];

        let result = matcher.match_segment(&key(), &points, None).unwrap();

        assert!(!result.is_matched());
        assert_eq!(result.mean_deviation, None);
        assert_eq!(result.direction, None);
        assert_eq!(result.deviations, vec![None, None]);
        assert_eq!(result.points, points);
    }

    /// A and B run parallel 100 m apart; three points on each give equal means.
    fn evenly_split() -> (RouteMatcher, Vec<GeoPoint>) {
        let a = east_west("1", LAT);
        let b = east_west("2", LAT + 100.0 / METERS_PER_DEGREE);
        let matcher = RouteMatcher::new(vec![b, a], MatcherConfig::default());
        let points = vec![
            north_of(0.0, -99.15),
            north_of(0.0, -99.145),
            north_of(0.0, -99.14),
            north_of(100.0, -99.135),
            north_of(100.0, -99.13),
            north_of(100.0, -99.125),
        ];
        (matcher, points)
    }

    #[test]
    fn test_even_split_prefers_previous_window_variant() {
        let (matcher, points) = evenly_split();
        let previous = VariantKey::new("2", "ida");

        let result = matcher
            .match_segment(&key(), &points, Some(&previous))
            .unwrap();

        assert_eq!(result.branch_id.as_deref(), Some("2"));
    }

    #[test]
    fn test_even_split_without_history_prefers_lowest_branch() {
        let (matcher, points) = evenly_split();

        let result = matcher.match_segment(&key(), &points, None).unwrap();
        assert_eq!(result.branch_id.as_deref(), Some("1"));

        // A previous variant that is not among the tied ones is ignored.
        let stale = VariantKey::new("9", "vuelta");
        let result = matcher
            .match_segment(&key(), &points, Some(&stale))
            .unwrap();
        assert_eq!(result.branch_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_matching_is_deterministic() {
        let (matcher, points) = evenly_split();
        let first = matcher.match_segment(&key(), &points, None).unwrap();
        for _ in 0..5 {
            assert_eq!(matcher.match_segment(&key(), &points, None).unwrap(), first);
        }
    }

    #[test]
    fn test_gap_edges_are_not_matched() {
        // Two pieces with a gap in the middle of the street.
        let v = RouteVariant::new(
            "RUTA 5",
            "1",
            "ida",
            vec![
                GeoPoint::new(LAT, -99.16),
                GeoPoint::new(LAT, -99.15),
                GeoPoint::new(LAT, -99.13),
                GeoPoint::new(LAT, -99.12),
            ],
        )
        .with_gaps(vec![2]);
        let config = MatcherConfig {
            max_search_radius_m: 100.0,
            ..Default::default()
        };
        let matcher = RouteMatcher::new(vec![v], config);

        let result = matcher
            .match_segment(&key(), &[GeoPoint::new(LAT, -99.14)], None)
            .unwrap();
        assert!(!result.is_matched());
    }
}
