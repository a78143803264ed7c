//! Jet-core detection on ensemble forecast fields.
//!
//! Jet cores are traced as the intersection of two isosurfaces (by default
//! the zero surfaces of the first wind speed derivatives across the flow
//! and in the vertical) and then narrowed by a chain of line filters.
//!
//! # Architecture
//!
//! ```text
//! GridReader ─► WeatherPredictionSource
//!                     │
//!                     ▼
//!              [GaussianBlurSource]
//!                     │
//!                     ▼
//!           PartialDerivativeSource ──────────────┐
//!                     │                           │
//!                     ▼                           │
//!        IsosurfaceIntersectionSource             │
//!                     │                           │
//!                     ▼                           ▼
//!    variable ─► hessian ─► angle ─► end pressure ─► length
//!                                                 │
//!                                  ┌──────────────┴──────────────┐
//!                                  ▼                             ▼
//!                       TrajectoryValueSource      TrajectoryArrowHeadsSource
//! ```
//!
//! Every stage is a [`task_graph::ScheduledDataSource`]: results are cached
//! per normalized request and shared between stages.
//!
//! # Example
//!
//! ```ignore
//! use jet_detection::{JetCoreConfig, JetCorePipeline};
//!
//! let pipeline = JetCorePipeline::builder()
//!     .data_source(source)
//!     .config(JetCoreConfig::default())
//!     .build()?;
//! let request = pipeline.compose_request(&init, &valid, &members);
//! let lines = pipeline.compute(&request).await?;
//! ```

pub mod blur;
pub mod config;
pub mod derivative;
pub mod filters;
pub mod geometry;
pub mod isosurface;
pub mod output;
pub mod pipeline;
pub mod reader;
pub mod testdata;

// Re-export commonly used types at crate root
pub use blur::GaussianBlurSource;
pub use config::{
    AngleFilterConfig, ArrowHeadsConfig, BlurConfig, BoundingBox3D, DerivativeConfig,
    EndPressureDifferenceFilterConfig, FilterConfig, GeometricLengthFilterConfig,
    HessianFilterConfig, IsosurfaceConfig, JetCoreConfig, RequestParameters,
    TrajectoryValuesConfig, VariableFilterConfig,
};
pub use derivative::{DerivativeOp, GeopotentialType, PartialDerivativeSource};
pub use filters::{
    AngleFilter, EndPressureDifferenceFilter, FilterStage, GeometricLengthFilter, HessianFilter,
    LineFilter, SelectionSource, VariableFilter,
};
pub use isosurface::{
    trace_intersection_lines, IsosurfaceIntersectionSource, TracedLines, TracerSettings,
};
pub use output::{arrow_head, TrajectoryArrowHeadsSource, TrajectoryValueSource};
pub use pipeline::{JetCorePipeline, JetCorePipelineBuilder};
pub use reader::{FieldRequest, GridReader, InMemoryReader, WeatherPredictionSource};
pub use testdata::{SyntheticJet, SyntheticJetReader};
