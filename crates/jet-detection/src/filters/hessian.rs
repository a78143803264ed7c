//! Hessian ridge filter.
//!
//! A jet core is a ridge of wind speed: looking across the flow and along
//! the vertical, the speed has a maximum. The filter samples the second
//! derivatives `dnn`, `dzz` and `dndz` of wind speed at every vertex and
//! accepts the vertex iff
//!
//! ```text
//! dnn < λ  and  dnn * dzz - dndz² > -λ
//! ```
//!
//! Isolated vertices disagreeing with both neighbours are flipped to match
//! them before the line is cut.

use std::collections::BTreeSet;

use jet_common::keys::{
    HESSIANFILTER_DERIVOPS, HESSIANFILTER_GEOPOTENTIAL, HESSIANFILTER_GEOPOTENTIAL_TYPE,
    HESSIANFILTER_VALUE, HESSIANFILTER_VARIABLES, MULTI_DERIVATIVE_OPS, MULTI_GEOPOTENTIAL,
    MULTI_GEOPOTENTIAL_TYPE, MULTI_VARIABLES,
};
use jet_common::{JetResult, LineVertex, Request, StructuredGrid, TrajectoryEnsembleSelection};
use rayon::prelude::*;
use task_graph::{get_task_graph, CacheHandle, SharedSource, Task};
use tracing::debug;

use super::{
    grid_input_keys, member_field_request, requested_members, resegment_by_flags, LineFilter,
};
use crate::config::{HessianFilterConfig, RequestParameters};
use crate::derivative::DerivativeOp;

const LOCAL_KEYS: &[&str] = &[
    HESSIANFILTER_VALUE,
    HESSIANFILTER_VARIABLES,
    HESSIANFILTER_DERIVOPS,
];
const OPTIONAL_KEYS: &[&str] = &[HESSIANFILTER_GEOPOTENTIAL, HESSIANFILTER_GEOPOTENTIAL_TYPE];
const MULTI_KEYS: &[&str] = &[
    MULTI_VARIABLES,
    MULTI_DERIVATIVE_OPS,
    MULTI_GEOPOTENTIAL,
    MULTI_GEOPOTENTIAL_TYPE,
];

/// Keeps vertices on wind speed ridges.
pub struct HessianFilter {
    derivatives: SharedSource<StructuredGrid>,
}

impl HessianFilter {
    /// `derivatives` is a partial-derivative stage serving the second
    /// derivative fields.
    pub fn new(derivatives: SharedSource<StructuredGrid>) -> Self {
        Self { derivatives }
    }

    /// Request for the `op` field of `member`.
    fn derivative_request(
        &self,
        request: &Request,
        config: &HessianFilterConfig,
        member: u32,
        op: DerivativeOp,
    ) -> Request {
        let mut field = member_field_request(
            request,
            &self.derivatives.required_keys(),
            member,
            op.as_str(),
        );
        field.remove_all(MULTI_KEYS);
        field.insert_str_list(MULTI_VARIABLES, &config.wind_variables);
        field.insert(MULTI_DERIVATIVE_OPS, op.as_str());
        if let Some(geopotential) = &config.geopotential {
            field.insert(MULTI_GEOPOTENTIAL, geopotential.as_str());
            field.insert(MULTI_GEOPOTENTIAL_TYPE, config.geopotential_type.as_str());
        }
        field
    }

    fn member_fields(
        &self,
        request: &Request,
        config: &HessianFilterConfig,
        member: u32,
    ) -> JetResult<Vec<CacheHandle<StructuredGrid>>> {
        config
            .derivative_ops
            .iter()
            .map(|&op| {
                self.derivatives
                    .get_data(&self.derivative_request(request, config, member, op))
            })
            .collect()
    }
}

/// True if the vertex lies on a ridge. Vertices outside the fields fail.
fn on_ridge(fields: &[CacheHandle<StructuredGrid>], v: &LineVertex, lambda: f32) -> bool {
    let sample = |n: usize| fields[n].interpolate_value(v.x, v.y, v.z);
    let (Some(dnn), Some(dzz), Some(dndz)) = (sample(0), sample(1), sample(2)) else {
        return false;
    };
    dnn < lambda && dnn * dzz - dndz * dndz > -lambda
}

/// Flip every vertex whose clamped neighbours both disagree with it.
///
/// Decisions use the unsmoothed flags, so flips do not propagate.
fn smooth_isolated(flags: &[bool]) -> Vec<bool> {
    let n = flags.len();
    (0..n)
        .map(|j| {
            let prev = flags[j.saturating_sub(1)];
            let next = flags[(j + 1).min(n - 1)];
            if prev != flags[j] && next != flags[j] {
                prev
            } else {
                flags[j]
            }
        })
        .collect()
}

impl LineFilter for HessianFilter {
    fn name(&self) -> &'static str {
        "hessian"
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        LOCAL_KEYS
    }

    fn input_required_keys(&self) -> BTreeSet<String> {
        let mut keys = grid_input_keys(self.derivatives.required_keys());
        for key in MULTI_KEYS {
            keys.remove(*key);
        }
        keys.extend(OPTIONAL_KEYS.iter().map(|k| k.to_string()));
        keys
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        let config = HessianFilterConfig::read_from(request)?;
        for member in requested_members(request)? {
            for op in config.derivative_ops {
                let field = self.derivative_request(request, &config, member, op);
                task.add_parent(get_task_graph(&self.derivatives, &field)?);
            }
        }
        Ok(())
    }

    fn filter(
        &self,
        request: &Request,
        input: &TrajectoryEnsembleSelection,
    ) -> JetResult<TrajectoryEnsembleSelection> {
        let config = HessianFilterConfig::read_from(request)?;
        let vertices = input.vertices();
        resegment_by_flags(input, |member, lines| {
            let fields = self.member_fields(request, &config, member)?;
            let mut flipped = 0;
            let flags: Vec<Vec<bool>> = lines
                .iter()
                .map(|line| {
                    let raw: Vec<bool> = vertices[line.indices()]
                        .par_iter()
                        .map(|v| on_ridge(&fields, v, config.lambda_threshold))
                        .collect();
                    let smoothed = smooth_isolated(&raw);
                    flipped += raw.iter().zip(&smoothed).filter(|(a, b)| a != b).count();
                    smoothed
                })
                .collect();
            debug!(member, flipped, "Smoothed ridge flags");
            Ok(flags)
        })
    }
}
