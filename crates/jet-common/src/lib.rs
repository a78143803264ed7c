//! Common types shared across the jet-core pipeline crates.
//!
//! - [`Request`]: canonical `KEY=VALUE;` parameter bags that identify work
//! - [`StructuredGrid`]: scalar fields on regular lon/lat/level grids
//! - [`IntersectionLines`] and [`TrajectoryEnsembleSelection`]: traced
//!   polylines and the per-member views filters emit over them
//! - [`TrajectoryValues`] and [`TrajectoryArrowHeads`]: quantities sampled
//!   along selected lines
//! - [`DataItem`]: anything the memory manager can hold

pub mod error;
pub mod grid;
pub mod item;
pub mod keys;
pub mod lines;
pub mod request;
pub mod values;

pub use error::{JetError, JetResult};
pub use grid::{FieldInfo, LevelType, StructuredGrid, VerticalCoordinate};
pub use item::DataItem;
pub use lines::{
    EnsembleRange, IntersectionLines, LineRange, LineVertex, SelectionBuilder,
    TrajectoryEnsembleSelection,
};
pub use request::Request;
pub use values::{ArrowHead, TrajectoryArrowHeads, TrajectoryValues, VertexSample};
