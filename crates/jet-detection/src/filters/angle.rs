//! Segment angle filter.

use jet_common::keys::ANGLEFILTER_VALUE;
use jet_common::{JetResult, Request, TrajectoryEnsembleSelection};

use super::{resegment_lines, LineFilter};
use crate::config::{AngleFilterConfig, RequestParameters};
use crate::geometry::turning_angle_deg;

/// Cuts lines at interior vertices turning by more than
/// `ANGLEFILTER_VALUE` degrees. First and last vertices always pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct AngleFilter;

impl AngleFilter {
    pub fn new() -> Self {
        Self
    }
}

impl LineFilter for AngleFilter {
    fn name(&self) -> &'static str {
        "angle"
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &[ANGLEFILTER_VALUE]
    }

    fn filter(
        &self,
        request: &Request,
        input: &TrajectoryEnsembleSelection,
    ) -> JetResult<TrajectoryEnsembleSelection> {
        let config = AngleFilterConfig::read_from(request)?;
        resegment_lines(input, |points, j| {
            if j == 0 || j + 1 >= points.len() {
                return true;
            }
            turning_angle_deg(&points[j - 1], &points[j], &points[j + 1]) <= config.max_angle_deg
        })
    }
}
