//! Line filters refining a [`TrajectoryEnsembleSelection`].
//!
//! Every filter is a [`LineFilter`] wrapped in a [`FilterStage`], which
//! makes it a pipeline stage: it strips its own keys, fetches the upstream
//! selection with the rest and emits a new selection over the same vertex
//! array. Filters either keep or drop whole lines, or test vertices and
//! re-segment each line into runs of accepted vertices.

pub mod angle;
pub mod end_pressure;
pub mod hessian;
pub mod length;
pub mod variable;

use std::collections::BTreeSet;
use std::sync::Arc;

use jet_common::keys::{MEMBER, MEMBERS, VARIABLE};
use jet_common::{
    JetResult, LineRange, LineVertex, Request, SelectionBuilder, TrajectoryEnsembleSelection,
};
use task_graph::{
    get_task_graph, key_set, MemoryManager, ScheduledDataSource, SharedSource, SourceCore, Task,
};
use tracing::info;

pub use angle::AngleFilter;
pub use end_pressure::EndPressureDifferenceFilter;
pub use hessian::HessianFilter;
pub use length::GeometricLengthFilter;
pub use variable::VariableFilter;

/// Shared handle to a stage emitting selections.
pub type SelectionSource = SharedSource<TrajectoryEnsembleSelection>;

/// The filtering logic of one filter stage.
pub trait LineFilter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Keys the filter consumes.
    fn locally_required_keys(&self) -> &[&'static str];

    /// Optional keys and the required keys of any grid inputs.
    fn input_required_keys(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Add grid requests the filter needs besides the input selection.
    fn create_task_graph(&self, _request: &Request, _task: &mut Task) -> JetResult<()> {
        Ok(())
    }

    /// Filter `input` under the parameters in `request`.
    fn filter(
        &self,
        request: &Request,
        input: &TrajectoryEnsembleSelection,
    ) -> JetResult<TrajectoryEnsembleSelection>;
}

/// Pipeline stage running a [`LineFilter`] on an upstream selection.
pub struct FilterStage<F: LineFilter> {
    core: SourceCore,
    input: SelectionSource,
    filter: F,
    pass_through: bool,
}

impl<F: LineFilter> FilterStage<F> {
    /// Requests lacking the filter's keys pass through to `input`.
    pub fn new(filter: F, input: SelectionSource, memory: Arc<MemoryManager>) -> Self {
        Self {
            core: SourceCore::new(format!("{}-filter", filter.name()), memory),
            input,
            filter,
            pass_through: true,
        }
    }

    /// Reject requests lacking the filter's keys instead of passing them on.
    pub fn without_pass_through(mut self) -> Self {
        self.pass_through = false;
        self
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    fn input_request(&self, request: &Request) -> Request {
        request.without(self.filter.locally_required_keys())
    }
}

impl<F: LineFilter> ScheduledDataSource for FilterStage<F> {
    type Output = TrajectoryEnsembleSelection;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        self.filter.locally_required_keys()
    }

    fn required_keys(&self) -> BTreeSet<String> {
        let mut keys = key_set(self.filter.locally_required_keys());
        keys.extend(self.filter.input_required_keys());
        keys.extend(self.input.required_keys());
        keys
    }

    fn pass_through(&self) -> Option<&SelectionSource> {
        self.pass_through.then_some(&self.input)
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        task.add_parent(get_task_graph(&self.input, &self.input_request(request))?);
        self.filter.create_task_graph(request, task)
    }

    fn produce_data(&self, request: &Request) -> JetResult<TrajectoryEnsembleSelection> {
        let input = self.input.get_data(&self.input_request(request))?;
        let output = self.filter.filter(request, &input)?;
        info!(
            filter = self.filter.name(),
            lines_in = input.num_lines(),
            lines_out = output.num_lines(),
            vertices_out = output.num_vertices(),
            "Filtered lines"
        );
        Ok(output)
    }
}

/// Re-segment every line of `input` by a per-vertex predicate.
///
/// `accept` sees the line's vertices and the index of the vertex within
/// the line.
pub(crate) fn resegment_lines(
    input: &TrajectoryEnsembleSelection,
    mut accept: impl FnMut(&[LineVertex], usize) -> bool,
) -> JetResult<TrajectoryEnsembleSelection> {
    let vertices = input.vertices();
    let mut builder = SelectionBuilder::new();
    for ensemble in input.ensembles() {
        builder.begin_member(ensemble.member);
        for line in input.member_lines(ensemble) {
            let points = &vertices[line.indices()];
            builder.resegment(*line, |j| accept(points, j - line.start));
        }
    }
    builder.finish(Arc::clone(input.refers_to()))
}

/// Re-segment lines by precomputed per-vertex flags.
///
/// `flags(member, lines)` returns, for every line of the member, one flag
/// per vertex.
pub(crate) fn resegment_by_flags(
    input: &TrajectoryEnsembleSelection,
    mut flags: impl FnMut(u32, &[LineRange]) -> JetResult<Vec<Vec<bool>>>,
) -> JetResult<TrajectoryEnsembleSelection> {
    let mut builder = SelectionBuilder::new();
    for ensemble in input.ensembles() {
        builder.begin_member(ensemble.member);
        let lines = input.member_lines(ensemble);
        let accepted = flags(ensemble.member, lines)?;
        for (line, accepted) in lines.iter().zip(&accepted) {
            builder.resegment(*line, |j| accepted[j - line.start]);
        }
    }
    builder.finish(Arc::clone(input.refers_to()))
}

/// Members named in `request`'s `MEMBERS` key.
pub(crate) fn requested_members(request: &Request) -> JetResult<BTreeSet<u32>> {
    request.uint_set_value(MEMBERS)
}

/// Grid request for `variable` of `member`, reduced to `grid_keys`.
pub(crate) fn member_field_request(
    request: &Request,
    grid_keys: &BTreeSet<String>,
    member: u32,
    variable: &str,
) -> Request {
    let mut field = request.clone();
    field.retain_only(grid_keys.iter().map(String::as_str));
    field.insert_int(MEMBER, member as i64);
    field.insert(VARIABLE, variable);
    field
}

/// Required keys of a grid input, without the per-member keys.
pub(crate) fn grid_input_keys(grid_keys: BTreeSet<String>) -> BTreeSet<String> {
    let mut keys = grid_keys;
    keys.remove(MEMBER);
    keys.remove(VARIABLE);
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use jet_common::keys::LEVELTYPE;
    use test_utils::fixtures::{assert_selection_invariants, ensemble_selection, line_vertices};

    #[test]
    fn test_resegment_lines_keeps_members() {
        let line = line_vertices(&[
            (0.0, 0.0, 250.0),
            (1.0, 0.0, 250.0),
            (2.0, 0.0, 250.0),
            (3.0, 0.0, 250.0),
        ]);
        let input = ensemble_selection(&[(0, vec![line.clone()]), (1, vec![line])]);

        // Drop the third vertex of member lines: [0, 1] survives, [3] is too short.
        let output = resegment_lines(&input, |_, j| j != 2).unwrap();
        assert_selection_invariants(&output);
        assert_eq!(output.num_members(), 2);
        assert_eq!(output.num_lines(), 2);
        assert_eq!(output.lines()[0], LineRange::new(0, 2));
        assert_eq!(output.lines()[1], LineRange::new(4, 2));
        assert!(Arc::ptr_eq(output.refers_to(), input.refers_to()));
    }

    #[test]
    fn test_member_field_request() {
        let request = Request::parse("MEMBERS=0/1;VARFILTER_VALUE=40;LEVELTYPE=pl;").unwrap();
        let grid_keys = key_set(&[LEVELTYPE, MEMBER, VARIABLE]);
        let field = member_field_request(&request, &grid_keys, 1, "wind_speed");
        assert_eq!(
            field.canonical(),
            "LEVELTYPE=pl;MEMBER=1;VARIABLE=wind_speed;"
        );
    }
}
