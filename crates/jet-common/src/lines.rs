//! Polyline vertex arrays and the selections that view into them.
//!
//! ```text
//! IntersectionLines.vertices  [v0 v1 v2 v3 v4 v5 v6 v7 v8 v9 ...]
//!                               └─line 0─┘ └line 1┘ └─ line 2 ─┘
//! selection.lines             [(0,4) (4,3) (7,4)]
//! selection.ensembles         [member 0: lines 0..2] [member 1: lines 2..3]
//! ```
//!
//! Filters never copy or modify vertices; they emit new selections with
//! different index ranges over the same shared vertex array.

use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{JetError, JetResult};
use crate::item::DataItem;

/// Line vertex as (longitude, latitude, pressure in hPa).
pub type LineVertex = Vector3<f32>;

/// Raw traced polyline vertices for all members of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntersectionLines {
    vertices: Vec<LineVertex>,
}

impl IntersectionLines {
    pub fn new(vertices: Vec<LineVertex>) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[LineVertex] {
        &self.vertices
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// A contiguous index range forming one polyline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub count: usize,
}

impl LineRange {
    pub fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end()
    }
}

/// The lines belonging to one ensemble member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleRange {
    pub member: u32,
    /// Index of the member's first line in the selection's line array.
    pub start: usize,
    pub count: usize,
}

impl EnsembleRange {
    pub fn lines(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.count
    }
}

/// A view selecting polylines from a shared vertex array, grouped by member.
#[derive(Debug, Clone)]
pub struct TrajectoryEnsembleSelection {
    refers_to: Arc<IntersectionLines>,
    lines: Vec<LineRange>,
    ensembles: Vec<EnsembleRange>,
}

impl TrajectoryEnsembleSelection {
    /// Build a selection and check its ranges against the vertex array.
    pub fn new(
        refers_to: Arc<IntersectionLines>,
        lines: Vec<LineRange>,
        ensembles: Vec<EnsembleRange>,
    ) -> JetResult<Self> {
        let selection = Self {
            refers_to,
            lines,
            ensembles,
        };
        selection.validate()?;
        Ok(selection)
    }

    /// The vertex array this selection indexes into.
    pub fn refers_to(&self) -> &Arc<IntersectionLines> {
        &self.refers_to
    }

    pub fn vertices(&self) -> &[LineVertex] {
        self.refers_to.vertices()
    }

    pub fn lines(&self) -> &[LineRange] {
        &self.lines
    }

    pub fn ensembles(&self) -> &[EnsembleRange] {
        &self.ensembles
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn num_members(&self) -> usize {
        self.ensembles.len()
    }

    /// Total number of vertices covered by the selected lines.
    pub fn num_vertices(&self) -> usize {
        self.lines.iter().map(|l| l.count).sum()
    }

    /// Vertices of line `index`.
    pub fn line_vertices(&self, index: usize) -> &[LineVertex] {
        let range = self.lines[index];
        &self.refers_to.vertices()[range.indices()]
    }

    /// The line ranges of one ensemble member.
    pub fn member_lines(&self, ensemble: &EnsembleRange) -> &[LineRange] {
        &self.lines[ensemble.lines()]
    }

    /// Check range and partition invariants.
    pub fn validate(&self) -> JetResult<()> {
        let nvertices = self.refers_to.len();
        for (n, line) in self.lines.iter().enumerate() {
            if line.end() > nvertices {
                return Err(JetError::InvalidValue {
                    key: format!("line {}", n),
                    value: format!("{}+{}", line.start, line.count),
                    message: format!("range exceeds {} vertices", nvertices),
                });
            }
            if line.count <= 1 {
                return Err(JetError::InvalidValue {
                    key: format!("line {}", n),
                    value: line.count.to_string(),
                    message: "degenerate line".to_string(),
                });
            }
        }

        let mut expected_start = 0;
        for e in &self.ensembles {
            if e.start != expected_start {
                return Err(JetError::InvalidValue {
                    key: format!("member {}", e.member),
                    value: e.start.to_string(),
                    message: format!("ensemble range must start at {}", expected_start),
                });
            }
            expected_start += e.count;
        }
        if expected_start != self.lines.len() {
            return Err(JetError::InvalidValue {
                key: "ensembles".to_string(),
                value: expected_start.to_string(),
                message: format!("ensemble ranges cover {} lines", self.lines.len()),
            });
        }
        Ok(())
    }
}

impl DataItem for TrajectoryEnsembleSelection {
    fn memory_size_kb(&self) -> usize {
        // The shared vertex array is accounted for by the stage that traced it.
        let bytes = self.lines.len() * std::mem::size_of::<LineRange>()
            + self.ensembles.len() * std::mem::size_of::<EnsembleRange>();
        bytes / 1024 + 1
    }
}

/// Incrementally builds a selection, member by member.
#[derive(Debug, Default)]
pub struct SelectionBuilder {
    lines: Vec<LineRange>,
    ensembles: Vec<EnsembleRange>,
    current: Option<(u32, usize)>,
}

impl SelectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting lines for `member`, closing any open member.
    pub fn begin_member(&mut self, member: u32) {
        self.end_member();
        self.current = Some((member, self.lines.len()));
    }

    /// Close the current member's range.
    pub fn end_member(&mut self) {
        if let Some((member, start)) = self.current.take() {
            self.ensembles.push(EnsembleRange {
                member,
                start,
                count: self.lines.len() - start,
            });
        }
    }

    /// Add a line. Lines with one or zero vertices are dropped.
    pub fn push_line(&mut self, start: usize, count: usize) {
        if count > 1 {
            self.lines.push(LineRange { start, count });
        }
    }

    /// Re-segment `line`, keeping runs of accepted vertices.
    ///
    /// A rejected vertex ends the current run and the scan resumes after it.
    /// Runs shorter than two vertices are discarded.
    pub fn resegment(&mut self, line: LineRange, mut accept: impl FnMut(usize) -> bool) {
        let mut run_start = line.start;
        let mut run_count = 0;
        for j in line.indices() {
            if accept(j) {
                run_count += 1;
            } else {
                self.push_line(run_start, run_count);
                run_start = j + 1;
                run_count = 0;
            }
        }
        self.push_line(run_start, run_count);
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn finish(mut self, refers_to: Arc<IntersectionLines>) -> JetResult<TrajectoryEnsembleSelection> {
        self.end_member();
        TrajectoryEnsembleSelection::new(refers_to, self.lines, self.ensembles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_line(n: usize) -> Arc<IntersectionLines> {
        Arc::new(IntersectionLines::new(
            (0..n).map(|i| LineVertex::new(i as f32, 0.0, 500.0)).collect(),
        ))
    }

    #[test]
    fn test_builder_groups_members() {
        let vertices = straight_line(10);
        let mut builder = SelectionBuilder::new();
        builder.begin_member(0);
        builder.push_line(0, 4);
        builder.push_line(4, 2);
        builder.begin_member(3);
        builder.push_line(6, 4);
        let selection = builder.finish(vertices).unwrap();

        assert_eq!(selection.num_lines(), 3);
        assert_eq!(
            selection.ensembles(),
            &[
                EnsembleRange { member: 0, start: 0, count: 2 },
                EnsembleRange { member: 3, start: 2, count: 1 },
            ]
        );
        assert_eq!(selection.line_vertices(2)[0].x, 6.0);
    }

    #[test]
    fn test_member_without_lines_has_empty_range() {
        let mut builder = SelectionBuilder::new();
        builder.begin_member(0);
        builder.begin_member(1);
        builder.push_line(0, 3);
        let selection = builder.finish(straight_line(3)).unwrap();
        assert_eq!(selection.ensembles()[0].count, 0);
        assert_eq!(selection.ensembles()[1].start, 0);
    }

    #[test]
    fn test_degenerate_lines_are_dropped() {
        let mut builder = SelectionBuilder::new();
        builder.begin_member(0);
        builder.push_line(0, 1);
        builder.push_line(1, 0);
        assert_eq!(builder.num_lines(), 0);
    }

    #[test]
    fn test_resegment_cuts_at_rejected_vertices() {
        let mut builder = SelectionBuilder::new();
        builder.begin_member(0);
        // Rejects vertex 3 and vertex 8; the run [9] is too short to keep.
        builder.resegment(LineRange::new(0, 10), |j| j != 3 && j != 8);
        let selection = builder.finish(straight_line(10)).unwrap();

        assert_eq!(
            selection.lines(),
            &[LineRange::new(0, 3), LineRange::new(4, 4)]
        );
    }

    #[test]
    fn test_resegment_keeps_fully_accepted_line() {
        let mut builder = SelectionBuilder::new();
        builder.begin_member(0);
        builder.resegment(LineRange::new(2, 5), |_| true);
        let selection = builder.finish(straight_line(7)).unwrap();
        assert_eq!(selection.lines(), &[LineRange::new(2, 5)]);
    }

    #[test]
    fn test_validate_rejects_out_of_range_lines() {
        let result = TrajectoryEnsembleSelection::new(
            straight_line(4),
            vec![LineRange::new(2, 3)],
            vec![EnsembleRange { member: 0, start: 0, count: 1 }],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_gaps_between_members() {
        let result = TrajectoryEnsembleSelection::new(
            straight_line(6),
            vec![LineRange::new(0, 3), LineRange::new(3, 3)],
            vec![
                EnsembleRange { member: 0, start: 0, count: 1 },
                EnsembleRange { member: 1, start: 0, count: 1 },
            ],
        );
        assert!(result.is_err());
    }
}
