//! Common test fixtures for jet-core tests.
//!
//! This module provides pre-defined forecast times, line geometries and
//! selection builders for filter and pipeline tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jet_common::{
    IntersectionLines, LineRange, LineVertex, SelectionBuilder, TrajectoryEnsembleSelection,
};

/// Forecast initialisation time used by every synthetic field.
pub fn test_init_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0)
        .single()
        .expect("valid fixture time")
}

/// Forecast valid time used by every synthetic field.
pub fn test_valid_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0)
        .single()
        .expect("valid fixture time")
}

/// Common polylines for filter tests, as (lon, lat, p_hpa) points.
pub mod lines {
    /// Five vertices heading east along the equator at 250 hPa.
    pub const STRAIGHT_EQUATOR: &[(f32, f32, f32)] = &[
        (0.0, 0.0, 250.0),
        (1.0, 0.0, 250.0),
        (2.0, 0.0, 250.0),
        (3.0, 0.0, 250.0),
        (4.0, 0.0, 250.0),
    ];

    /// Heads east, then turns back west one degree (~179°) at vertex 2.
    pub const HAIRPIN: &[(f32, f32, f32)] = &[
        (0.0, 0.0, 250.0),
        (1.0, 0.0, 250.0),
        (2.0, 0.0, 250.0),
        (1.0, 0.0175, 250.0),
        (0.0, 0.035, 250.0),
    ];

    /// Ten degrees long on the equator whose last vertex drops 80 hPa.
    pub const DIVING_END: &[(f32, f32, f32)] = &[
        (0.0, 0.0, 250.0),
        (2.0, 0.0, 250.0),
        (4.0, 0.0, 250.0),
        (6.0, 0.0, 250.0),
        (8.0, 0.0, 255.0),
        (10.0, 0.0, 335.0),
    ];
}

/// Convert (lon, lat, p_hpa) tuples to line vertices.
pub fn line_vertices(points: &[(f32, f32, f32)]) -> Vec<LineVertex> {
    points
        .iter()
        .map(|&(lon, lat, p)| LineVertex::new(lon, lat, p))
        .collect()
}

/// Build a selection holding every given line in full, grouped per member.
///
/// # Example
///
/// ```
/// use test_utils::fixtures::{ensemble_selection, line_vertices, lines};
///
/// let selection = ensemble_selection(&[(0, vec![line_vertices(lines::STRAIGHT_EQUATOR)])]);
/// assert_eq!(selection.num_lines(), 1);
/// assert_eq!(selection.num_vertices(), 5);
/// ```
pub fn ensemble_selection(members: &[(u32, Vec<Vec<LineVertex>>)]) -> TrajectoryEnsembleSelection {
    let mut vertices = Vec::new();
    let mut builder = SelectionBuilder::new();
    for (member, member_lines) in members {
        builder.begin_member(*member);
        for line in member_lines {
            builder.push_line(vertices.len(), line.len());
            vertices.extend_from_slice(line);
        }
    }
    builder
        .finish(Arc::new(IntersectionLines::new(vertices)))
        .expect("fixture selection must be valid")
}

/// Selection of one member holding the given lines.
pub fn single_member_selection(lines: &[&[(f32, f32, f32)]]) -> TrajectoryEnsembleSelection {
    ensemble_selection(&[(0, lines.iter().map(|l| line_vertices(l)).collect())])
}

/// Assert the structural invariants every selection must hold.
///
/// # Panics
///
/// Panics if a line range leaves the vertex array, a line has fewer than
/// two vertices, or the ensemble ranges do not partition the lines.
pub fn assert_selection_invariants(selection: &TrajectoryEnsembleSelection) {
    let num_vertices = selection.refers_to().len();
    for (n, line) in selection.lines().iter().enumerate() {
        assert!(line.count > 1, "line {} has {} vertices", n, line.count);
        assert!(
            line.end() <= num_vertices,
            "line {} ends at {} beyond {} vertices",
            n,
            line.end(),
            num_vertices
        );
    }
    let mut next = 0;
    for ensemble in selection.ensembles() {
        assert_eq!(ensemble.start, next, "member {} is not contiguous", ensemble.member);
        next += ensemble.count;
    }
    assert_eq!(next, selection.num_lines(), "ensembles do not cover all lines");
}

/// Vertices of every line in the selection.
pub fn selected_lines(selection: &TrajectoryEnsembleSelection) -> Vec<Vec<LineVertex>> {
    selection
        .lines()
        .iter()
        .map(|line: &LineRange| selection.vertices()[line.indices()].to_vec())
        .collect()
}
