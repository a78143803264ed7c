//! Horizontal geometry on lon/lat polylines.
//!
//! Distances use the local flat-earth approximation: longitude differences
//! are shrunk by the cosine of latitude and one degree is 111.2 km.

use jet_common::LineVertex;
use nalgebra::Vector2;

/// Length of one degree of latitude.
pub const KM_PER_DEGREE: f32 = 111.2;
pub const METRES_PER_DEGREE: f32 = KM_PER_DEGREE * 1000.0;

/// Horizontal length of the segment `p0 -> p1` in km.
pub fn segment_length_km(p0: &LineVertex, p1: &LineVertex) -> f32 {
    let dlon = (p1.x - p0.x) * p1.y.to_radians().cos();
    let dlat = p1.y - p0.y;
    dlon.hypot(dlat) * KM_PER_DEGREE
}

/// Horizontal length of a polyline in km.
pub fn line_length_km(vertices: &[LineVertex]) -> f32 {
    vertices
        .windows(2)
        .map(|w| segment_length_km(&w[0], &w[1]))
        .sum()
}

/// Unit horizontal direction of `from -> to` with longitude scaled by
/// `cos_lat`. None for coincident points.
fn scaled_direction(from: &LineVertex, to: &LineVertex, cos_lat: f32) -> Option<Vector2<f32>> {
    let d = Vector2::new((to.x - from.x) * cos_lat, to.y - from.y);
    let norm = d.norm();
    (norm > 0.0).then(|| d / norm)
}

/// Turning angle in degrees at `p1` between the segments `p0 -> p1` and
/// `p1 -> p2`. Zero for degenerate segments.
pub fn turning_angle_deg(p0: &LineVertex, p1: &LineVertex, p2: &LineVertex) -> f32 {
    let cos_lat = p1.y.to_radians().cos();
    match (
        scaled_direction(p0, p1, cos_lat),
        scaled_direction(p1, p2, cos_lat),
    ) {
        (Some(a), Some(b)) => a.dot(&b).clamp(-1.0, 1.0).acos().to_degrees(),
        _ => 0.0,
    }
}
