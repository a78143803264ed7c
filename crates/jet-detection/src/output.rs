//! Render output derived from a filtered selection.
//!
//! [`TrajectoryValueSource`] samples a colour and a thickness field at
//! every selected vertex; [`TrajectoryArrowHeadsSource`] puts one arrow
//! head on the downstream end of every selected line. Both fetch their
//! fields per member and keep the line order of the selection.

use std::collections::BTreeSet;
use std::sync::Arc;

use jet_common::keys::{
    ARROWHEADS_MEMBERS, ARROWHEADS_SOURCEVAR, ARROWHEADS_UV_VARIABLES, TRAJECTORYVALUES_MEMBERS,
    TRAJECTORYVALUES_THICKNESSVAR, TRAJECTORYVALUES_VARIABLE,
};
use jet_common::{
    ArrowHead, EnsembleRange, JetError, JetResult, LineVertex, Request, StructuredGrid,
    TrajectoryArrowHeads, TrajectoryEnsembleSelection, TrajectoryValues, VertexSample,
};
use nalgebra::Vector2;
use task_graph::{
    get_task_graph, key_set, CacheHandle, MemoryManager, ScheduledDataSource, SharedSource,
    SourceCore, Task,
};
use tracing::info;

use crate::config::{ArrowHeadsConfig, RequestParameters, TrajectoryValuesConfig};
use crate::filters::{grid_input_keys, member_field_request, SelectionSource};

const VALUE_KEYS: &[&str] = &[
    TRAJECTORYVALUES_VARIABLE,
    TRAJECTORYVALUES_THICKNESSVAR,
    TRAJECTORYVALUES_MEMBERS,
];
const ARROW_KEYS: &[&str] = &[ARROWHEADS_UV_VARIABLES, ARROWHEADS_SOURCEVAR, ARROWHEADS_MEMBERS];

/// Selection and per-member fields shared by both output stages.
struct LineInputs {
    selection: SelectionSource,
    grids: SharedSource<StructuredGrid>,
}

impl LineInputs {
    fn required_keys(&self, local: &[&str]) -> BTreeSet<String> {
        let mut keys = key_set(local);
        keys.extend(grid_input_keys(self.grids.required_keys()));
        keys.extend(self.selection.required_keys());
        keys
    }

    fn field_request(&self, request: &Request, member: u32, variable: &str) -> Request {
        member_field_request(request, &self.grids.required_keys(), member, variable)
    }

    fn create_task_graph(
        &self,
        request: &Request,
        task: &mut Task,
        local: &[&str],
        members_key: &str,
        variables: &[&str],
    ) -> JetResult<()> {
        for member in request.uint_set_value(members_key)? {
            for variable in variables {
                let field = self.field_request(request, member, variable);
                task.add_parent(get_task_graph(&self.grids, &field)?);
            }
        }
        task.add_parent(get_task_graph(&self.selection, &request.without(local))?);
        Ok(())
    }

    fn selection(
        &self,
        request: &Request,
        local: &[&str],
    ) -> JetResult<CacheHandle<TrajectoryEnsembleSelection>> {
        self.selection.get_data(&request.without(local))
    }

    /// Field `variable` of the ensemble's member, if the member was requested.
    fn member_field(
        &self,
        request: &Request,
        members_key: &str,
        members: &BTreeSet<u32>,
        ensemble: &EnsembleRange,
        variable: Option<&str>,
    ) -> JetResult<Option<CacheHandle<StructuredGrid>>> {
        if !members.contains(&ensemble.member) {
            return Err(JetError::invalid_value(
                members_key,
                request.value(members_key).unwrap_or_default(),
                format!("selection contains unrequested member {}", ensemble.member),
            ));
        }
        variable
            .map(|v| self.grids.get_data(&self.field_request(request, ensemble.member, v)))
            .transpose()
    }
}

/// Field value at `v`; zero without a field, NaN outside it.
fn sample(grid: Option<&StructuredGrid>, v: &LineVertex) -> f32 {
    grid.map_or(0.0, |grid| {
        grid.interpolate_value(v.x, v.y, v.z).unwrap_or(f32::NAN)
    })
}

// ============================================================================
// Per-vertex values
// ============================================================================

/// Samples `TRAJECTORYVALUES_VARIABLE` and `TRAJECTORYVALUES_THICKNESSVAR`
/// at every vertex of the upstream selection.
pub struct TrajectoryValueSource {
    core: SourceCore,
    inputs: LineInputs,
}

impl TrajectoryValueSource {
    /// `grids` serves the sampled fields, one request per member.
    pub fn new(
        selection: SelectionSource,
        grids: SharedSource<StructuredGrid>,
        memory: Arc<MemoryManager>,
    ) -> Self {
        Self {
            core: SourceCore::new("trajectory-values", memory),
            inputs: LineInputs { selection, grids },
        }
    }
}

impl ScheduledDataSource for TrajectoryValueSource {
    type Output = TrajectoryValues;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        VALUE_KEYS
    }

    fn required_keys(&self) -> BTreeSet<String> {
        self.inputs.required_keys(VALUE_KEYS)
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        let config = TrajectoryValuesConfig::read_from(request)?;
        let variables: Vec<&str> = [&config.variable, &config.thickness_variable]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        self.inputs
            .create_task_graph(request, task, VALUE_KEYS, TRAJECTORYVALUES_MEMBERS, &variables)
    }

    fn produce_data(&self, request: &Request) -> JetResult<TrajectoryValues> {
        let config = TrajectoryValuesConfig::read_from(request)?;
        let members = request.uint_set_value(TRAJECTORYVALUES_MEMBERS)?;
        let selection = self.inputs.selection(request, VALUE_KEYS)?;
        let vertices = selection.vertices();

        let mut values =
            TrajectoryValues::with_capacity(selection.num_vertices(), selection.num_lines());
        for ensemble in selection.ensembles() {
            let field = |variable: Option<&str>| {
                self.inputs.member_field(
                    request,
                    TRAJECTORYVALUES_MEMBERS,
                    &members,
                    ensemble,
                    variable,
                )
            };
            let value_grid = field(config.variable.as_deref())?;
            let thickness_grid = field(config.thickness_variable.as_deref())?;

            for line in selection.member_lines(ensemble) {
                values.push_line(vertices[line.indices()].iter().map(|v| VertexSample {
                    value: sample(value_grid.as_deref(), v),
                    thickness: sample(thickness_grid.as_deref(), v),
                }));
            }
        }

        info!(
            lines = values.num_lines(),
            vertices = values.samples().len(),
            variable = config.variable.as_deref().unwrap_or("none"),
            "Sampled trajectory values"
        );
        Ok(values)
    }
}

// ============================================================================
// Arrow heads
// ============================================================================

/// Places an arrow head on the end of each selected line that the wind
/// blows towards.
///
/// The wind at the first vertex decides: if it runs against the first
/// segment, the arrow sits on the first vertex pointing backwards,
/// otherwise on the last vertex along the last segment. Without wind data
/// at the first vertex the arrow goes to the last vertex.
pub struct TrajectoryArrowHeadsSource {
    core: SourceCore,
    inputs: LineInputs,
}

impl TrajectoryArrowHeadsSource {
    /// `grids` serves the wind components and the colour field.
    pub fn new(
        selection: SelectionSource,
        grids: SharedSource<StructuredGrid>,
        memory: Arc<MemoryManager>,
    ) -> Self {
        Self {
            core: SourceCore::new("trajectory-arrow-heads", memory),
            inputs: LineInputs { selection, grids },
        }
    }
}

/// Normalized horizontal direction from `a` to `b`; zero if they coincide.
fn horizontal_direction(a: &LineVertex, b: &LineVertex) -> Vector2<f32> {
    Vector2::new(b.x - a.x, b.y - a.y)
        .try_normalize(f32::EPSILON)
        .unwrap_or_else(Vector2::zeros)
}

/// Arrow head of one line given the wind at its first vertex.
pub fn arrow_head(
    points: &[LineVertex],
    wind: Option<Vector2<f32>>,
    value_at: impl Fn(&LineVertex) -> f32,
) -> Option<ArrowHead> {
    let (first, second) = (points.first()?, points.get(1)?);
    let n = points.len();
    let (before_last, last) = (&points[n - 2], &points[n - 1]);

    let tangent_start = horizontal_direction(first, second);
    let upstream_start = wind.is_some_and(|wind| {
        let wind = wind.try_normalize(f32::EPSILON).unwrap_or_else(Vector2::zeros);
        tangent_start.dot(&wind) <= 0.0
    });

    Some(if upstream_start {
        ArrowHead {
            position: *first,
            direction: -tangent_start,
            value: value_at(first),
        }
    } else {
        ArrowHead {
            position: *last,
            direction: horizontal_direction(before_last, last),
            value: value_at(last),
        }
    })
}

impl ScheduledDataSource for TrajectoryArrowHeadsSource {
    type Output = TrajectoryArrowHeads;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        ARROW_KEYS
    }

    fn required_keys(&self) -> BTreeSet<String> {
        self.inputs.required_keys(ARROW_KEYS)
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        let config = ArrowHeadsConfig::read_from(request)?;
        let mut variables: Vec<&str> = config.wind_variables.iter().map(String::as_str).collect();
        variables.extend(config.variable.as_deref());
        self.inputs
            .create_task_graph(request, task, ARROW_KEYS, ARROWHEADS_MEMBERS, &variables)
    }

    fn produce_data(&self, request: &Request) -> JetResult<TrajectoryArrowHeads> {
        let config = ArrowHeadsConfig::read_from(request)?;
        let members = request.uint_set_value(ARROWHEADS_MEMBERS)?;
        let selection = self.inputs.selection(request, ARROW_KEYS)?;
        let vertices = selection.vertices();
        let [u_name, v_name] = &config.wind_variables;

        let mut heads = Vec::with_capacity(selection.num_lines());
        for ensemble in selection.ensembles() {
            let field = |variable: Option<&str>| {
                self.inputs
                    .member_field(request, ARROWHEADS_MEMBERS, &members, ensemble, variable)
            };
            let u = field(Some(u_name.as_str()))?;
            let v = field(Some(v_name.as_str()))?;
            let colour = field(config.variable.as_deref())?;

            for line in selection.member_lines(ensemble) {
                let points = &vertices[line.indices()];
                let start = &points[0];
                let wind = u.as_deref().zip(v.as_deref()).and_then(|(u, v)| {
                    let eastward = u.interpolate_value(start.x, start.y, start.z)?;
                    let northward = v.interpolate_value(start.x, start.y, start.z)?;
                    Some(Vector2::new(eastward, northward))
                });
                heads.extend(arrow_head(points, wind, |p| sample(colour.as_deref(), p)));
            }
        }

        info!(heads = heads.len(), "Placed arrow heads");
        Ok(TrajectoryArrowHeads::new(heads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(coords: &[(f32, f32)]) -> Vec<LineVertex> {
        coords
            .iter()
            .map(|&(x, y)| LineVertex::new(x, y, 250.0))
            .collect()
    }

    #[test]
    fn test_arrow_follows_wind() {
        let line = points(&[(0.0, 0.0), (1.0, 0.0), (2.0, 1.0)]);

        // Westerly wind: the line runs downstream, arrow at the end.
        let head = arrow_head(&line, Some(Vector2::new(10.0, 0.0)), |_| 1.0).unwrap();
        assert_eq!(head.position, line[2]);
        let diagonal = std::f32::consts::FRAC_1_SQRT_2;
        assert!((head.direction - Vector2::new(diagonal, diagonal)).norm() < 1e-6);
        assert_eq!(head.value, 1.0);

        // Easterly wind: arrow on the first vertex, pointing west.
        let head = arrow_head(&line, Some(Vector2::new(-10.0, 0.0)), |_| 1.0).unwrap();
        assert_eq!(head.position, line[0]);
        assert_eq!(head.direction, Vector2::new(-1.0, 0.0));
    }

    #[test]
    fn test_arrow_without_wind_sits_at_end() {
        let line = points(&[(0.0, 0.0), (1.0, 0.0)]);
        let head = arrow_head(&line, None, |p| p.x).unwrap();
        assert_eq!(head.position, line[1]);
        assert_eq!(head.value, 1.0);

        // Calm air counts as running against the line.
        let head = arrow_head(&line, Some(Vector2::zeros()), |p| p.x).unwrap();
        assert_eq!(head.position, line[0]);
    }

    #[test]
    fn test_degenerate_line_has_no_arrow() {
        assert!(arrow_head(&points(&[(0.0, 0.0)]), None, |_| 0.0).is_none());
    }

    #[test]
    fn test_sample_without_field_is_zero() {
        let v = LineVertex::new(0.0, 0.0, 500.0);
        assert_eq!(sample(None, &v), 0.0);
    }
}
