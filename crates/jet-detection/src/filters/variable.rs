//! Variable threshold filter.

use std::collections::BTreeSet;

use jet_common::keys::{VARFILTER_VALUE, VARFILTER_VARIABLE};
use jet_common::{JetResult, Request, StructuredGrid, TrajectoryEnsembleSelection};
use rayon::prelude::*;
use task_graph::{get_task_graph, SharedSource, Task};

use super::{
    grid_input_keys, member_field_request, requested_members, resegment_by_flags, LineFilter,
};
use crate::config::{RequestParameters, VariableFilterConfig};

/// Cuts lines where `VARFILTER_VARIABLE` interpolated at a vertex falls
/// below `VARFILTER_VALUE`. Vertices outside the field count as below.
pub struct VariableFilter {
    grids: SharedSource<StructuredGrid>,
}

impl VariableFilter {
    /// `grids` serves the filter variable, one request per member.
    pub fn new(grids: SharedSource<StructuredGrid>) -> Self {
        Self { grids }
    }

    fn field_request(&self, request: &Request, member: u32, variable: &str) -> Request {
        member_field_request(request, &self.grids.required_keys(), member, variable)
    }
}

impl LineFilter for VariableFilter {
    fn name(&self) -> &'static str {
        "variable"
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &[VARFILTER_VARIABLE, VARFILTER_VALUE]
    }

    fn input_required_keys(&self) -> BTreeSet<String> {
        grid_input_keys(self.grids.required_keys())
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        let config = VariableFilterConfig::read_from(request)?;
        for member in requested_members(request)? {
            let field = self.field_request(request, member, &config.variable);
            task.add_parent(get_task_graph(&self.grids, &field)?);
        }
        Ok(())
    }

    fn filter(
        &self,
        request: &Request,
        input: &TrajectoryEnsembleSelection,
    ) -> JetResult<TrajectoryEnsembleSelection> {
        let config = VariableFilterConfig::read_from(request)?;
        let vertices = input.vertices();
        resegment_by_flags(input, |member, lines| {
            let grid = self
                .grids
                .get_data(&self.field_request(request, member, &config.variable))?;
            Ok(lines
                .iter()
                .map(|line| {
                    vertices[line.indices()]
                        .par_iter()
                        .map(|v| {
                            grid.interpolate_value(v.x, v.y, v.z)
                                .is_some_and(|value| value >= config.threshold)
                        })
                        .collect()
                })
                .collect())
        })
    }
}
