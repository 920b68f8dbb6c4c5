//! Official route variants and the loaders that build them.
//!
//! Two JSON layouts are accepted:
//!
//! * node segments, as published for the official routes:
//!   ```json
//!   { "1": { "ida": { "confirmada": [[101, 102]], "hueco": [], "inconfirmada": [[103]] } } }
//!   ```
//!   Node ids resolve through a [`NodeTable`] exported from the road network.
//! * coordinate lists, `[lon, lat]` pairs per branch and direction:
//!   ```json
//!   { "1": { "Ida": [[-99.13, 19.43], [-99.12, 19.44]] } }
//!   ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::geometry::GeoPoint;

/// One branch/direction of a route, as an ordered path.
///
/// `gaps` lists indices `i` where the edge from `points[i - 1]` to
/// `points[i]` is not part of the path, so disjoint pieces can live in a
/// single sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteVariant {
    pub route_id: String,
    pub branch_id: String,
    pub direction: String,
    pub points: Vec<GeoPoint>,
    #[serde(default)]
    pub gaps: Vec<usize>,
}

impl RouteVariant {
    pub fn new(
        route_id: impl Into<String>,
        branch_id: impl Into<String>,
        direction: impl Into<String>,
        points: Vec<GeoPoint>,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            branch_id: branch_id.into(),
            direction: direction.into(),
            points,
            gaps: Vec::new(),
        }
    }

    pub fn with_gaps(mut self, gaps: Vec<usize>) -> Self {
        self.gaps = gaps;
        self
    }

    pub fn key(&self) -> VariantKey {
        VariantKey {
            branch_id: self.branch_id.clone(),
            direction: self.direction.clone(),
        }
    }

    /// One line string per connected piece.
    ///
    /// An isolated point becomes a zero-length line string so it can still
    /// be matched against and drawn.
    pub fn line_strings(&self) -> Vec<LineString<f64>> {
        self.pieces()
            .into_iter()
            .map(|piece| {
                let mut coords: Vec<Coord<f64>> = piece.iter().map(|&p| p.into()).collect();
                if coords.len() == 1 {
                    coords.push(coords[0]);
                }
                LineString::new(coords)
            })
            .collect()
    }

    /// The connected runs of `points`, split at every gap.
    pub fn pieces(&self) -> Vec<&[GeoPoint]> {
        let mut bounds: Vec<usize> = self
            .gaps
            .iter()
            .copied()
            .filter(|&g| g > 0 && g < self.points.len())
            .collect();
        bounds.sort_unstable();
        bounds.dedup();

        let mut pieces = Vec::with_capacity(bounds.len() + 1);
        let mut start = 0;
        for end in bounds {
            pieces.push(&self.points[start..end]);
            start = end;
        }
        if start < self.points.len() {
            pieces.push(&self.points[start..]);
        }
        pieces
    }
}

/// Identity of a variant within one route.
///
/// Ordering compares branch ids numerically when both parse as integers
/// ("2" < "10"), lexically otherwise, then direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantKey {
    pub branch_id: String,
    pub direction: String,
}

impl VariantKey {
    pub fn new(branch_id: impl Into<String>, direction: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            direction: direction.into(),
        }
    }
}

impl Ord for VariantKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_branch_ids(&self.branch_id, &other.branch_id)
            .then_with(|| self.direction.cmp(&other.direction))
    }
}

impl PartialOrd for VariantKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_branch_ids(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Road-network node coordinates keyed by node id.
#[derive(Debug, Default, Clone)]
pub struct NodeTable {
    nodes: HashMap<u64, GeoPoint>,
}

#[derive(Deserialize)]
struct NodeRow {
    #[serde(alias = "osmid", alias = "id")]
    node_id: u64,
    #[serde(alias = "lon", alias = "longitude")]
    x: f64,
    #[serde(alias = "lat", alias = "latitude")]
    y: f64,
}

impl NodeTable {
    /// Reads a CSV with `node_id`, `x` (longitude) and `y` (latitude)
    /// columns, as written by a road-network node export.
    pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut nodes = HashMap::new();
        for row in rdr.deserialize() {
            let row: NodeRow = row?;
            nodes.insert(row.node_id, GeoPoint::new(row.y, row.x));
        }
        Ok(Self { nodes })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening node table {}", path.display()))?;
        Self::from_reader(file)
    }

    pub fn insert(&mut self, node_id: u64, point: GeoPoint) {
        self.nodes.insert(node_id, point);
    }

    pub fn get(&self, node_id: u64) -> Option<GeoPoint> {
        self.nodes.get(&node_id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Deserialize, Default)]
struct SegmentsByStatus {
    #[serde(default)]
    confirmada: Vec<Vec<u64>>,
    #[serde(default)]
    hueco: Vec<Vec<u64>>,
    #[serde(default)]
    inconfirmada: Vec<Vec<u64>>,
}

type NodeSegmentFile = BTreeMap<String, BTreeMap<String, SegmentsByStatus>>;
type CoordinateFile = BTreeMap<String, BTreeMap<String, Vec<[f64; 2]>>>;

/// Builds variants from the node-segment layout.
///
/// Segments are appended confirmed first, then gaps, then unconfirmed; every
/// segment starts a new piece of the path.
///
/// # Errors
///
/// [`PipelineError::Input`] for malformed JSON or node ids missing from
/// `nodes`.
pub fn variants_from_node_segments(
    route_id: &str,
    json: &str,
    nodes: &NodeTable,
) -> Result<Vec<RouteVariant>> {
    let parsed: NodeSegmentFile = serde_json::from_str(json)
        .map_err(|e| PipelineError::input(format!("malformed route JSON: {e}")))?;

    let mut variants = Vec::new();
    for (branch, directions) in parsed {
        for (direction, segments) in directions {
            let mut points = Vec::new();
            let mut gaps = Vec::new();

            let all = segments
                .confirmada
                .iter()
                .chain(&segments.hueco)
                .chain(&segments.inconfirmada);
            for segment in all.filter(|s| !s.is_empty()) {
                if !points.is_empty() {
                    gaps.push(points.len());
                }
                for &node_id in segment {
                    let point = nodes.get(node_id).ok_or_else(|| {
                        PipelineError::input(format!(
                            "route {route_id} branch {branch} {direction}: unknown node {node_id}"
                        ))
                    })?;
                    points.push(point);
                }
            }

            variants.push(
                RouteVariant::new(route_id, branch.clone(), direction, points).with_gaps(gaps),
            );
        }
    }

    variants.sort_by_key(|v| v.key());
    Ok(variants)
}

/// Builds variants from the `[lon, lat]` coordinate-list layout.
pub fn variants_from_coordinates(route_id: &str, json: &str) -> Result<Vec<RouteVariant>> {
    let parsed: CoordinateFile = serde_json::from_str(json)
        .map_err(|e| PipelineError::input(format!("malformed route JSON: {e}")))?;

    let mut variants: Vec<RouteVariant> = parsed
        .into_iter()
        .flat_map(|(branch, directions)| {
            directions.into_iter().map(move |(direction, coords)| {
                let points = coords
                    .iter()
                    .map(|[lon, lat]| GeoPoint::new(*lat, *lon))
                    .collect();
                RouteVariant::new(route_id, branch.clone(), direction, points)
            })
        })
        .collect();

    variants.sort_by_key(|v| v.key());
    Ok(variants)
}

/// Loads a route file, resolving node ids through `nodes` when given.
pub fn load_route_file(
    path: &Path,
    route_id: &str,
    nodes: Option<&NodeTable>,
) -> anyhow::Result<Vec<RouteVariant>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading route file {}", path.display()))?;

    let variants = match nodes {
        Some(nodes) => variants_from_node_segments(route_id, &json, nodes)?,
        None => variants_from_coordinates(route_id, &json)?,
    };

    info!(
        path = %path.display(),
        route_id,
        variants = variants.len(),
        "Loaded route variants"
    );
    Ok(variants)
}
