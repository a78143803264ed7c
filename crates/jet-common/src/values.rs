//! Quantities sampled along selected lines, for rendering.
//!
//! Both types follow the line order of the selection they were computed
//! from: member by member, line by line.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::item::DataItem;
use crate::lines::LineVertex;

/// Colour and thickness value at one line vertex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexSample {
    pub value: f32,
    pub thickness: f32,
}

/// One [`VertexSample`] per vertex of every selected line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectoryValues {
    samples: Vec<VertexSample>,
    /// Offset of each line's first sample; one extra entry closes the last line.
    offsets: Vec<usize>,
}

impl TrajectoryValues {
    pub fn with_capacity(vertices: usize, lines: usize) -> Self {
        let mut offsets = Vec::with_capacity(lines + 1);
        offsets.push(0);
        Self {
            samples: Vec::with_capacity(vertices),
            offsets,
        }
    }

    /// Append the samples of the next line.
    pub fn push_line(&mut self, samples: impl IntoIterator<Item = VertexSample>) {
        if self.offsets.is_empty() {
            self.offsets.push(0);
        }
        self.samples.extend(samples);
        self.offsets.push(self.samples.len());
    }

    pub fn samples(&self) -> &[VertexSample] {
        &self.samples
    }

    pub fn num_lines(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Samples of line `index`.
    pub fn line(&self, index: usize) -> &[VertexSample] {
        &self.samples[self.offsets[index]..self.offsets[index + 1]]
    }

    pub fn lines(&self) -> impl Iterator<Item = &[VertexSample]> + '_ {
        (0..self.num_lines()).map(|n| self.line(n))
    }
}

impl DataItem for TrajectoryValues {
    fn memory_size_kb(&self) -> usize {
        let bytes = self.samples.len() * std::mem::size_of::<VertexSample>()
            + self.offsets.len() * std::mem::size_of::<usize>();
        bytes / 1024 + 1
    }
}

/// Arrow head marking the flow direction of one line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrowHead {
    /// Line end the arrow sits on.
    pub position: LineVertex,
    /// Horizontal unit direction the arrow points to.
    pub direction: Vector2<f32>,
    /// Colour value at the arrow position.
    pub value: f32,
}

/// One [`ArrowHead`] per selected line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectoryArrowHeads {
    heads: Vec<ArrowHead>,
}

impl TrajectoryArrowHeads {
    pub fn new(heads: Vec<ArrowHead>) -> Self {
        Self { heads }
    }

    pub fn heads(&self) -> &[ArrowHead] {
        &self.heads
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}

impl DataItem for TrajectoryArrowHeads {
    fn memory_size_kb(&self) -> usize {
        self.heads.len() * std::mem::size_of::<ArrowHead>() / 1024 + 1
    }
}
