//! Intersection lines of two isosurfaces, traced per ensemble member.
//!
//! # Algorithm
//!
//! 1. Classify every grid cell against both isovalues and keep the faces
//!    both isosurfaces cross ([`tables::FACE_TABLE`]).
//! 2. On each such face, intersect the isolines of both fields; the
//!    resulting points are paired into per-cell segments ([`cell`]).
//! 3. Starting from cells away from the domain boundary, follow segments
//!    from cell to cell across shared faces until the curve leaves the
//!    domain, runs into consumed cells or closes on itself ([`trace`]).
//! 4. Crop the lines to the requested bounding box.

pub mod cell;
pub mod tables;
pub mod trace;

use std::collections::BTreeSet;
use std::sync::Arc;

use jet_common::keys::{
    ISOX_BOUNDING_BOX, ISOX_DERIVATIVE_OPS, ISOX_VALUES, ISOX_VARIABLES, MEMBER, MEMBERS,
    MULTI_DERIVATIVE_OPS, MULTI_GEOPOTENTIAL, MULTI_GEOPOTENTIAL_TYPE, MULTI_VARIABLES, VARIABLE,
};
use jet_common::{
    DataItem, IntersectionLines, JetResult, LineRange, LineVertex, Request, SelectionBuilder,
    StructuredGrid, TrajectoryEnsembleSelection,
};
use task_graph::{
    get_task_graph, key_set, MemoryManager, ScheduledDataSource, SharedSource, SourceCore, Task,
};
use tracing::info;

use crate::config::{IsosurfaceConfig, RequestParameters};

pub use trace::{trace_intersection_lines, TracerSettings};

const LOCAL_KEYS: &[&str] = &[ISOX_VARIABLES, ISOX_VALUES, MEMBERS, ISOX_BOUNDING_BOX];
const MULTI_KEYS: &[&str] = &[
    MULTI_VARIABLES,
    MULTI_DERIVATIVE_OPS,
    MULTI_GEOPOTENTIAL,
    MULTI_GEOPOTENTIAL_TYPE,
];

/// Lines traced for one member, before cropping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracedLines {
    pub lines: Vec<Vec<LineVertex>>,
}

impl TracedLines {
    pub fn num_vertices(&self) -> usize {
        self.lines.iter().map(Vec::len).sum()
    }
}

impl DataItem for TracedLines {
    fn memory_size_kb(&self) -> usize {
        self.num_vertices() * std::mem::size_of::<LineVertex>() / 1024 + 1
    }
}

/// Produces the intersection lines of the isosurfaces of two fields for
/// every requested member.
pub struct IsosurfaceIntersectionSource {
    core: SourceCore,
    inputs: [SharedSource<StructuredGrid>; 2],
    settings: TracerSettings,
}

impl IsosurfaceIntersectionSource {
    /// `input_a` and `input_b` serve the first and second field; they may
    /// be the same source.
    pub fn new(
        input_a: SharedSource<StructuredGrid>,
        input_b: SharedSource<StructuredGrid>,
        memory: Arc<MemoryManager>,
    ) -> Self {
        Self {
            core: SourceCore::new("isosurface-intersection", memory),
            inputs: [input_a, input_b],
            settings: TracerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TracerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Request for field `n` of `member`.
    fn field_request(
        request: &Request,
        config: &IsosurfaceConfig,
        member: u32,
        n: usize,
    ) -> Request {
        let mut upstream = request.without(LOCAL_KEYS);
        upstream.remove(ISOX_DERIVATIVE_OPS);
        upstream.insert_int(MEMBER, member as i64);
        upstream.insert(VARIABLE, config.variables[n].as_str());
        match config.derivative_ops[n] {
            Some(op) => upstream.insert(MULTI_DERIVATIVE_OPS, op.as_str()),
            None => upstream.remove_all(MULTI_KEYS),
        }
        upstream
    }

    /// Cache key of the uncropped lines of one member.
    fn member_key(request: &Request, member: u32) -> String {
        let mut key = request.without(&[MEMBERS, ISOX_BOUNDING_BOX]);
        key.insert_int(MEMBER, member as i64);
        key.canonical()
    }

    fn trace_member(
        &self,
        request: &Request,
        config: &IsosurfaceConfig,
        member: u32,
    ) -> JetResult<TracedLines> {
        let a = self.inputs[0].get_data(&Self::field_request(request, config, member, 0))?;
        let b = self.inputs[1].get_data(&Self::field_request(request, config, member, 1))?;
        let lines = trace_intersection_lines(&a, &b, config.isovalues, &self.settings)?;
        Ok(TracedLines { lines })
    }
}

impl ScheduledDataSource for IsosurfaceIntersectionSource {
    type Output = TrajectoryEnsembleSelection;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        LOCAL_KEYS
    }

    fn required_keys(&self) -> BTreeSet<String> {
        let mut keys = key_set(LOCAL_KEYS);
        keys.insert(ISOX_DERIVATIVE_OPS.to_string());
        for input in &self.inputs {
            keys.extend(input.required_keys());
        }
        // Set per member from MEMBERS.
        keys.remove(MEMBER);
        keys.remove(VARIABLE);
        keys.remove(MULTI_DERIVATIVE_OPS);
        keys
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        let config = IsosurfaceConfig::read_from(request)?;
        let reduced = self.normalized_request(request)?;
        let core = self.core();
        for member in request.uint_set_value(MEMBERS)? {
            if core
                .memory()
                .is_cached(core.id(), &Self::member_key(&reduced, member))
            {
                continue;
            }
            for (n, input) in self.inputs.iter().enumerate() {
                let field = Self::field_request(request, &config, member, n);
                task.add_parent(get_task_graph(input, &field)?);
            }
        }
        Ok(())
    }

    fn produce_data(&self, request: &Request) -> JetResult<TrajectoryEnsembleSelection> {
        let config = IsosurfaceConfig::read_from(request)?;
        let members = request.uint_set_value(MEMBERS)?;
        let core = self.core();

        let mut vertices: Vec<LineVertex> = Vec::new();
        let mut builder = SelectionBuilder::new();
        let mut traced_lines = 0;
        for &member in &members {
            builder.begin_member(member);
            let traced = core.memory().get_or_compute(
                core.id(),
                &Self::member_key(request, member),
                || self.trace_member(request, &config, member),
            )?;
            traced_lines += traced.lines.len();
            for line in &traced.lines {
                let start = vertices.len();
                vertices.extend_from_slice(line);
                builder.resegment(LineRange::new(start, line.len()), |j| {
                    config.bounding_box.contains(&vertices[j])
                });
            }
        }

        let selection = builder.finish(Arc::new(IntersectionLines::new(vertices)))?;
        info!(
            members = ?members,
            traced = traced_lines,
            lines = selection.num_lines(),
            vertices = selection.num_vertices(),
            "Traced intersection lines"
        );
        Ok(selection)
    }
}
