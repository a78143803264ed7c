//! Stitch per-cell segments into polylines.

use std::collections::VecDeque;

use jet_common::{JetError, JetResult, LineVertex, StructuredGrid};
use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::debug;

use super::cell::{CellSampler, Crossing, Segment};
use super::tables::Face;

/// Per-axis distance below which two traced vertices are the same point.
///
/// Curves running through grid nodes or edges are reported by every face
/// touching them.
const COINCIDENT: f32 = 1e-4;

/// Tuning of the line tracer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracerSettings {
    /// Cells closer than this to the domain boundary never seed a line.
    pub seed_margin: usize,
    /// Per-axis distance (degrees and hPa) below which the ends of a line
    /// with more than three vertices are joined.
    pub closure_tolerance: f32,
}

impl Default for TracerSettings {
    fn default() -> Self {
        Self {
            seed_margin: 2,
            closure_tolerance: 5.0,
        }
    }
}

/// Trace the intersection lines of the `iso[0]` isosurface of `a` with the
/// `iso[1]` isosurface of `b`.
///
/// Lines are returned as vertex lists (lon, lat, pressure); lines with
/// fewer than two vertices are dropped.
pub fn trace_intersection_lines(
    a: &StructuredGrid,
    b: &StructuredGrid,
    iso: [f32; 2],
    settings: &TracerSettings,
) -> JetResult<Vec<Vec<LineVertex>>> {
    if !a.same_topology(b) {
        return Err(JetError::InvalidGrid(format!(
            "cannot intersect '{}' and '{}': grid topologies differ",
            a.variable(),
            b.variable()
        )));
    }
    if a.nlons() < 2 || a.nlats() < 2 || a.nlevels() < 2 {
        return Err(JetError::InvalidGrid(format!(
            "isosurface intersection needs a 3D grid, got {}x{}x{}",
            a.nlons(),
            a.nlats(),
            a.nlevels()
        )));
    }

    let mut cells = CellGrid::new(a.nlons() - 1, a.nlats() - 1, a.nlevels() - 1);
    let sampler = CellSampler::new(a, b, iso);
    cells.segments = (0..cells.len())
        .into_par_iter()
        .map(|c| {
            let (i, j, k) = cells.coords(c);
            sampler.segments(i, j, k)
        })
        .collect();
    cells.visited = cells.segments.iter().map(Vec::is_empty).collect();

    let m = settings.seed_margin;
    let mut lines = Vec::new();
    for k in m..cells.nk.saturating_sub(m) {
        for j in m..cells.nj.saturating_sub(m) {
            for i in m..cells.ni.saturating_sub(m) {
                let c = cells.index(i, j, k);
                while let Some(seed) = cells.segments[c].pop() {
                    lines.push(cells.trace(seed, c, settings.closure_tolerance));
                }
                cells.visited[c] = true;
            }
        }
    }

    lines.retain(|line| line.len() >= 2);
    debug!(
        variable_a = a.variable(),
        variable_b = b.variable(),
        lines = lines.len(),
        "Traced intersection lines"
    );
    Ok(lines)
}

/// Remaining segments of every cell.
struct CellGrid {
    ni: usize,
    nj: usize,
    nk: usize,
    segments: Vec<Vec<Segment>>,
    /// Set once a cell has no segments left.
    visited: Vec<bool>,
}

impl CellGrid {
    fn new(ni: usize, nj: usize, nk: usize) -> Self {
        Self {
            ni,
            nj,
            nk,
            segments: Vec::new(),
            visited: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.ni * self.nj * self.nk
    }

    fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.nj + j) * self.ni + i
    }

    fn coords(&self, c: usize) -> (usize, usize, usize) {
        (c % self.ni, (c / self.ni) % self.nj, c / (self.ni * self.nj))
    }

    fn neighbour(&self, c: usize, face: Face) -> Option<usize> {
        let (i, j, k) = self.coords(c);
        let (di, dj, dk) = face.offset();
        let step = |x: usize, d: isize, n: usize| {
            x.checked_add_signed(d).filter(|&v| v < n)
        };
        Some(self.index(
            step(i, di, self.ni)?,
            step(j, dj, self.nj)?,
            step(k, dk, self.nk)?,
        ))
    }

    /// Follow the curve from `seed` in both directions.
    ///
    /// A line whose ends meet is closed by repeating its second and third
    /// vertex, so every vertex has a predecessor and a successor.
    fn trace(&mut self, seed: Segment, cell: usize, tolerance: f32) -> Vec<LineVertex> {
        let [first, last] = seed.ends;
        let mut line = VecDeque::from([first.position, last.position]);
        line.extend(self.follow(cell, last));
        for p in self.follow(cell, first) {
            line.push_front(p);
        }

        let mut line = Vec::from(line);
        line.dedup_by(|a, b| is_close(a, b, COINCIDENT));
        if line.len() > 3 && is_close(&line[0], &line[line.len() - 1], tolerance) {
            let wrap = [line[1], line[2]];
            line.extend(wrap);
        }
        line
    }

    /// Walk from cell to cell across exit faces until the curve leaves the
    /// domain or runs into a consumed cell.
    fn follow(&mut self, mut cell: usize, mut exit: Crossing) -> Vec<LineVertex> {
        let mut walked = Vec::new();
        while let Some(next) = self.neighbour(cell, exit.face) {
            if self.visited[next] {
                break;
            }
            let Some(out) = self.take_connecting(next, &exit) else {
                break;
            };
            walked.push(out.position);
            cell = next;
            exit = out;
        }
        walked
    }

    /// Remove the segment of `cell` that continues the curve arriving
    /// through `exit`, and return its far end.
    fn take_connecting(&mut self, cell: usize, exit: &Crossing) -> Option<Crossing> {
        let entry = exit.face.opposite();
        let (di, dj, dk) = exit.face.offset();
        let expected = exit.local - Vector3::new(di as f32, dj as f32, dk as f32);

        let segments = &mut self.segments[cell];
        let (n, end) = segments
            .iter()
            .enumerate()
            .flat_map(|(n, s)| s.ends.iter().enumerate().map(move |(end, e)| (n, end, e)))
            .filter(|(_, _, e)| e.face == entry)
            .map(|(n, end, e)| (n, end, (e.local - expected).norm()))
            .min_by(|x, y| x.2.total_cmp(&y.2))
            .map(|(n, end, _)| (n, end))?;

        let segment = segments.swap_remove(n);
        if segments.is_empty() {
            self.visited[cell] = true;
        }
        Some(segment.ends[1 - end])
    }
}

fn is_close(a: &LineVertex, b: &LineVertex, tolerance: f32) -> bool {
    (a - b).iter().all(|d| d.abs() <= tolerance)
}
