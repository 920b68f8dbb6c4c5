//! Road snapping: projecting GPS fixes onto the nearest road.
//!
//! The matcher only ever sees the output of [`Snapper::nearest_point`], so
//! any road-network backend (or none) can sit behind it.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fetch::{HttpClient, fetch_json};
use crate::geometry::GeoPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct SnappedPoint {
    pub point: GeoPoint,
    /// Name of the street the point was snapped to, when the backend knows it.
    pub street_name: Option<String>,
}

impl SnappedPoint {
    pub fn unsnapped(point: GeoPoint) -> Self {
        Self {
            point,
            street_name: None,
        }
    }
}

#[async_trait]
pub trait Snapper: Send + Sync {
    async fn nearest_point(&self, point: GeoPoint) -> Result<SnappedPoint>;
}

#[async_trait]
impl<S: Snapper + ?Sized> Snapper for Box<S> {
    async fn nearest_point(&self, point: GeoPoint) -> Result<SnappedPoint> {
        (**self).nearest_point(point).await
    }
}

/// Leaves points where they are. Used when no road network is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSnapper;

#[async_trait]
impl Snapper for PassthroughSnapper {
    async fn nearest_point(&self, point: GeoPoint) -> Result<SnappedPoint> {
        Ok(SnappedPoint::unsnapped(point))
    }
}

/// Snaps through an OSRM `nearest` endpoint.
pub struct OsrmSnapper<C> {
    client: C,
    base_url: String,
    profile: String,
}

#[derive(Deserialize)]
struct NearestResponse {
    #[serde(default)]
    waypoints: Vec<Waypoint>,
}

#[derive(Deserialize)]
struct Waypoint {
    /// `[lon, lat]`
    location: [f64; 2],
    #[serde(default)]
    name: String,
}

impl<C: HttpClient> OsrmSnapper<C> {
    pub fn new(client: C, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            profile: "driving".to_string(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn nearest_url(&self, point: &GeoPoint) -> String {
        format!(
            "{}/nearest/v1/{}/{},{}?number=1",
            self.base_url, self.profile, point.longitude, point.latitude
        )
    }
}

#[async_trait]
impl<C: HttpClient> Snapper for OsrmSnapper<C> {
    async fn nearest_point(&self, point: GeoPoint) -> Result<SnappedPoint> {
        let url = self.nearest_url(&point);
        let response: NearestResponse = fetch_json(&self.client, &url).await?;

        match response.waypoints.into_iter().next() {
            Some(wp) => {
                let [lon, lat] = wp.location;
                Ok(SnappedPoint {
                    point: GeoPoint::new(lat, lon),
                    street_name: Some(wp.name).filter(|n| !n.is_empty()),
                })
            }
            None => {
                debug!(lat = point.latitude, lon = point.longitude, "No road near point");
                Ok(SnappedPoint::unsnapped(point))
            }
        }
    }
}

/// Snaps every point in order. A failed lookup keeps the raw point so one
/// bad request does not drop a fix from the trace.
pub async fn snap_all<S: Snapper + ?Sized>(snapper: &S, points: &[GeoPoint]) -> Vec<SnappedPoint> {
    let mut snapped = Vec::with_capacity(points.len());
    let mut failures = 0usize;

    for point in points {
        match snapper.nearest_point(*point).await {
            Ok(s) => snapped.push(s),
            Err(e) => {
                failures += 1;
                debug!(error = %e, "Snap request failed, keeping raw point");
                snapped.push(SnappedPoint::unsnapped(*point));
            }
        }
    }

    if failures > 0 {
        warn!(failures, total = points.len(), "Some points could not be snapped");
    }
    snapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;

    struct FailingSnapper;

    #[async_trait]
    impl Snapper for FailingSnapper {
        async fn nearest_point(&self, _point: GeoPoint) -> Result<SnappedPoint> {
            Err(anyhow::anyhow!("service unavailable"))
        }
    }

    #[test]
    fn test_nearest_url_is_lon_lat() {
        let snapper = OsrmSnapper::new(BasicClient::new(), "http://router.project-osrm.org/");
        let url = snapper.nearest_url(&GeoPoint::new(19.4326, -99.1332));
        assert_eq!(
            url,
            "http://router.project-osrm.org/nearest/v1/driving/-99.1332,19.4326?number=1"
        );
    }

    #[test]
    fn test_waypoint_response_parsing() {
        let body = r#"{"code":"Ok","waypoints":[{"location":[-99.13318,19.43262],"name":"Avenida 5 de Mayo","distance":3.2}]}"#;
        let parsed: NearestResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.waypoints[0].location, [-99.13318, 19.43262]);
        assert_eq!(parsed.waypoints[0].name, "Avenida 5 de Mayo");
    }

    #[tokio::test]
    async fn test_passthrough_keeps_point() {
        let p = GeoPoint::new(19.43, -99.13);
        let snapped = PassthroughSnapper.nearest_point(p).await.unwrap();
        assert_eq!(snapped, SnappedPoint::unsnapped(p));
    }

    #[tokio::test]
    async fn test_snap_all_falls_back_on_failure() {
        let points = vec![GeoPoint::new(19.43, -99.13), GeoPoint::new(19.44, -99.12)];
        let snapped = snap_all(&FailingSnapper, &points).await;

        assert_eq!(snapped.len(), 2);
        assert_eq!(snapped[1].point, points[1]);
        assert!(snapped.iter().all(|s| s.street_name.is_none()));
    }
}
