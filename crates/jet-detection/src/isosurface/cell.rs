//! Intersection segments of two isosurfaces inside one grid cell.
//!
//! On every face crossed by both isosurfaces, each surface leaves one or two
//! isolines. Where an isoline of A meets an isoline of B, the intersection
//! curve pierces the face. The piercing points of a cell are then paired
//! into segments.

use jet_common::{LineVertex, StructuredGrid};
use nalgebra::{Vector2, Vector3};

use super::tables::{Face, EDGE_TABLE, FACE_EDGES, FACE_TABLE};

/// Face-local coordinates of fp0..fp3.
const FACE_LOCAL: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];

const DEGENERATE_EDGE: f32 = 1e-6;
const PARAMETER_SLACK: f32 = 1e-5;

/// A point where the intersection curve pierces a cell face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    /// World position: (lon, lat, pressure in hPa).
    pub position: LineVertex,
    pub face: Face,
    /// Position in cell-local coordinates, each in [0, 1].
    pub local: Vector3<f32>,
}

/// A piece of the intersection curve between two face crossings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub ends: [Crossing; 2],
}

type Isoline = [Vector2<f32>; 2];

fn face_local(n: usize) -> Vector2<f32> {
    Vector2::new(FACE_LOCAL[n][0], FACE_LOCAL[n][1])
}

fn corner_offset(c: usize) -> (usize, usize, usize) {
    (c & 1, (c >> 1) & 1, c >> 2)
}

fn corner_local(c: usize) -> Vector3<f32> {
    let (di, dj, dk) = corner_offset(c);
    Vector3::new(di as f32, dj as f32, dk as f32)
}

/// Bit c is set iff corner c lies below `iso`.
pub fn cube_index(values: &[f32; 8], iso: f32) -> usize {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v < iso)
        .fold(0, |acc, (c, _)| acc | (1 << c))
}

/// Position of `iso` on the edge from `v0` to `v1`, in [0, 1].
fn edge_parameter(v0: f32, v1: f32, iso: f32) -> f32 {
    if (v1 - v0).abs() < DEGENERATE_EDGE {
        return 0.5;
    }
    ((iso - v0) / (v1 - v0)).clamp(0.0, 1.0)
}

/// Isolines of one face in face-local coordinates.
///
/// Saddle faces (all four edges cut) are disambiguated with the mean of
/// the corner values.
fn face_isolines(values: &[f32; 4], iso: f32) -> Vec<Isoline> {
    let code = values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v < iso)
        .fold(0, |acc, (n, _)| acc | (1 << n));
    let edges = EDGE_TABLE[code];

    let cuts: Vec<Vector2<f32>> = FACE_EDGES
        .iter()
        .enumerate()
        .filter(|(e, _)| edges.contains(*e))
        .map(|(_, &(p, q))| {
            let mu = edge_parameter(values[p], values[q], iso);
            face_local(p) + (face_local(q) - face_local(p)) * mu
        })
        .collect();

    match cuts.len() {
        2 => vec![[cuts[0], cuts[1]]],
        4 => {
            let centre = values.iter().sum::<f32>() / 4.0;
            if (centre < iso) == (values[0] < iso) {
                // fp0 and fp3 connect through the centre; fp1 and fp2 are cut off.
                vec![[cuts[0], cuts[1]], [cuts[2], cuts[3]]]
            } else {
                vec![[cuts[3], cuts[0]], [cuts[1], cuts[2]]]
            }
        }
        _ => Vec::new(),
    }
}

fn cross(a: Vector2<f32>, b: Vector2<f32>) -> f32 {
    a.x * b.y - a.y * b.x
}

/// Intersection point of two face-local segments.
fn intersect_isolines(a: &Isoline, b: &Isoline) -> Option<Vector2<f32>> {
    let da = a[1] - a[0];
    let db = b[1] - b[0];
    let denom = cross(da, db);
    if denom.abs() < 1e-12 {
        return None;
    }
    let offset = b[0] - a[0];
    let ta = cross(offset, db) / denom;
    let tb = cross(offset, da) / denom;
    let range = -PARAMETER_SLACK..=1.0 + PARAMETER_SLACK;
    (range.contains(&ta) && range.contains(&tb)).then(|| a[0] + da * ta.clamp(0.0, 1.0))
}

fn bilinear(corners: [Vector3<f32>; 4], st: Vector2<f32>) -> Vector3<f32> {
    let (s, t) = (st.x, st.y);
    corners[0] * ((1.0 - s) * (1.0 - t))
        + corners[1] * (s * (1.0 - t))
        + corners[2] * ((1.0 - s) * t)
        + corners[3] * (s * t)
}

/// The two grids and isovalues being intersected.
pub struct CellSampler<'a> {
    a: &'a StructuredGrid,
    b: &'a StructuredGrid,
    iso: [f32; 2],
}

impl<'a> CellSampler<'a> {
    pub fn new(a: &'a StructuredGrid, b: &'a StructuredGrid, iso: [f32; 2]) -> Self {
        Self { a, b, iso }
    }

    /// Segments of the intersection curve inside cell (i, j, k).
    pub fn segments(&self, i: usize, j: usize, k: usize) -> Vec<Segment> {
        let mut va = [0.0f32; 8];
        let mut vb = [0.0f32; 8];
        let mut positions = [LineVertex::zeros(); 8];
        for c in 0..8 {
            let (di, dj, dk) = corner_offset(c);
            let (ii, jj, kk) = (i + di, j + dj, k + dk);
            va[c] = self.a.value(kk, jj, ii);
            vb[c] = self.b.value(kk, jj, ii);
            if va[c].is_nan() || vb[c].is_nan() {
                return Vec::new();
            }
            positions[c] = LineVertex::new(
                self.a.lons()[ii],
                self.a.lats()[jj],
                self.a.pressure(kk, jj, ii),
            );
        }

        let common =
            FACE_TABLE[cube_index(&va, self.iso[0])] & FACE_TABLE[cube_index(&vb, self.iso[1])];
        if common.is_empty() {
            return Vec::new();
        }

        let mut crossings = Vec::new();
        for face in common.iter() {
            let fp = face.corners();
            let face_a = fp.map(|c| va[c]);
            let face_b = fp.map(|c| vb[c]);
            let lines_a = face_isolines(&face_a, self.iso[0]);
            let lines_b = face_isolines(&face_b, self.iso[1]);
            for la in &lines_a {
                for lb in &lines_b {
                    if let Some(st) = intersect_isolines(la, lb) {
                        crossings.push(Crossing {
                            position: bilinear(fp.map(|c| positions[c]), st),
                            face,
                            local: bilinear(fp.map(corner_local), st),
                        });
                    }
                }
            }
        }
        pair_crossings(crossings)
    }
}

/// Pair the crossings of one cell into segments.
///
/// Three crossings form a bifurcation: the crossing alone on its face acts
/// as the hub joined to the other two. Four or more are paired so that the
/// summed cell-local segment length is minimal.
pub fn pair_crossings(crossings: Vec<Crossing>) -> Vec<Segment> {
    let segment = |a: usize, b: usize| Segment {
        ends: [crossings[a], crossings[b]],
    };
    match crossings.len() {
        0 | 1 => Vec::new(),
        2 => vec![segment(0, 1)],
        3 => {
            let hub = (0..3)
                .find(|&n| {
                    crossings
                        .iter()
                        .enumerate()
                        .all(|(m, other)| m == n || other.face != crossings[n].face)
                })
                .unwrap_or(0);
            (0..3)
                .filter(|&n| n != hub)
                .map(|n| segment(hub, n))
                .collect()
        }
        4 => {
            let dist = |a: usize, b: usize| (crossings[a].local - crossings[b].local).norm();
            let pairings = [[(0, 1), (2, 3)], [(0, 2), (1, 3)], [(0, 3), (1, 2)]];
            let best = pairings
                .iter()
                .min_by(|x, y| {
                    let lx = dist(x[0].0, x[0].1) + dist(x[1].0, x[1].1);
                    let ly = dist(y[0].0, y[0].1) + dist(y[1].0, y[1].1);
                    lx.total_cmp(&ly)
                })
                .unwrap_or(&pairings[0]);
            best.iter().map(|&(a, b)| segment(a, b)).collect()
        }
        _ => {
            // Greedy nearest-neighbour matching.
            let mut unpaired: Vec<usize> = (0..crossings.len()).collect();
            let mut segments = Vec::new();
            while unpaired.len() >= 2 {
                let a = unpaired.remove(0);
                let (slot, _) = unpaired
                    .iter()
                    .enumerate()
                    .map(|(slot, &b)| (slot, (crossings[a].local - crossings[b].local).norm()))
                    .min_by(|x, y| x.1.total_cmp(&y.1))
                    .unwrap_or((0, 0.0));
                let b = unpaired.remove(slot);
                segments.push(segment(a, b));
            }
            segments
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::generators::{grid_from_fn, pressure_axis};

    #[test]
    fn test_edge_parameter() {
        assert_eq!(edge_parameter(0.0, 2.0, 1.0), 0.5);
        assert_eq!(edge_parameter(1.0, 1.0, 1.0), 0.5);
        assert_eq!(edge_parameter(0.0, 1.0, 5.0), 1.0);
    }

    #[test]
    fn test_face_isoline_single_corner() {
        // Only fp0 below: the isoline cuts e0 and e3.
        let lines = face_isolines(&[0.0, 2.0, 2.0, 2.0], 1.0);
        assert_eq!(lines.len(), 1);
        let [p, q] = lines[0];
        assert!((p - Vector2::new(0.5, 0.0)).norm() < 1e-6);
        assert!((q - Vector2::new(0.0, 0.5)).norm() < 1e-6);
    }

    #[test]
    fn test_saddle_resolution() {
        // fp0 and fp3 below, centre below: fp1 and fp2 are cut off.
        let lines = face_isolines(&[0.0, 2.0, 2.0, 0.5], 1.2);
        assert_eq!(lines.len(), 2);
        // Isoline around fp1 joins e0 (bottom) and e1 (right).
        assert!(lines[0][0].y.abs() < 1e-6);
        assert!((lines[0][1].x - 1.0).abs() < 1e-6);

        // Same corners, centre above: fp0 and fp3 are cut off.
        let lines = face_isolines(&[0.0, 2.0, 2.0, 0.5], 0.8);
        assert_eq!(lines.len(), 2);
        assert!(lines[0][0].x.abs() < 1e-6);
        assert!(lines[0][1].y.abs() < 1e-6);
    }

    #[test]
    fn test_isoline_intersection() {
        let a = [Vector2::new(0.5, 0.0), Vector2::new(0.5, 1.0)];
        let b = [Vector2::new(0.0, 0.25), Vector2::new(1.0, 0.25)];
        let p = intersect_isolines(&a, &b).unwrap();
        assert!((p - Vector2::new(0.5, 0.25)).norm() < 1e-6);

        let parallel = [Vector2::new(0.6, 0.0), Vector2::new(0.6, 1.0)];
        assert!(intersect_isolines(&a, &parallel).is_none());
    }

    #[test]
    fn test_cell_with_straight_intersection() {
        let levels = pressure_axis(&[1000.0, 900.0]);
        let a = grid_from_fn("a", 2, 2, levels.clone(), |_, lat, _| lat - 0.5);
        let b = grid_from_fn("b", 2, 2, levels, |_, _, p| p - 950.0);
        let segments = CellSampler::new(&a, &b, [0.0, 0.0]).segments(0, 0, 0);

        assert_eq!(segments.len(), 1);
        let [start, end] = segments[0].ends;
        assert_eq!(start.face, Face::Left);
        assert_eq!(end.face, Face::Right);
        assert!((start.position - LineVertex::new(0.0, 0.5, 950.0)).norm() < 1e-4);
        assert!((end.position - LineVertex::new(1.0, 0.5, 950.0)).norm() < 1e-4);
    }

    #[test]
    fn test_nan_cell_is_skipped() {
        let levels = pressure_axis(&[1000.0, 900.0]);
        let mut a = grid_from_fn("a", 2, 2, levels.clone(), |_, lat, _| lat - 0.5);
        a.set_value(1, 1, 1, f32::NAN);
        let b = grid_from_fn("b", 2, 2, levels, |_, _, p| p - 950.0);
        assert!(CellSampler::new(&a, &b, [0.0, 0.0]).segments(0, 0, 0).is_empty());
    }

    fn crossing(face: Face, local: [f32; 3]) -> Crossing {
        let local = Vector3::new(local[0], local[1], local[2]);
        Crossing {
            position: local,
            face,
            local,
        }
    }

    #[test]
    fn test_bifurcation_hub_is_lonely_face() {
        let segments = pair_crossings(vec![
            crossing(Face::Left, [0.0, 0.2, 0.5]),
            crossing(Face::Left, [0.0, 0.8, 0.5]),
            crossing(Face::Right, [1.0, 0.5, 0.5]),
        ]);
        assert_eq!(segments.len(), 2);
        for segment in &segments {
            assert_eq!(segment.ends[0].face, Face::Right);
        }
    }

    #[test]
    fn test_four_crossings_pair_by_length() {
        let segments = pair_crossings(vec![
            crossing(Face::Left, [0.0, 0.1, 0.5]),
            crossing(Face::Right, [1.0, 0.9, 0.5]),
            crossing(Face::Front, [0.1, 0.0, 0.5]),
            crossing(Face::Back, [0.9, 1.0, 0.5]),
        ]);
        let faces: Vec<_> = segments
            .iter()
            .map(|s| (s.ends[0].face, s.ends[1].face))
            .collect();
        assert_eq!(
            faces,
            vec![(Face::Left, Face::Front), (Face::Right, Face::Back)]
        );
    }
}
