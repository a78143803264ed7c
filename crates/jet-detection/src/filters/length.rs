//! Geometric length filter.

use std::sync::Arc;

use jet_common::keys::GEOLENFILTER_VALUE;
use jet_common::{JetResult, Request, SelectionBuilder, TrajectoryEnsembleSelection};

use super::LineFilter;
use crate::config::{GeometricLengthFilterConfig, RequestParameters};
use crate::geometry::line_length_km;

/// Keeps lines at least `GEOLENFILTER_VALUE` kilometres long.
///
/// Lines are kept or dropped as a whole, never split.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeometricLengthFilter;

impl GeometricLengthFilter {
    pub fn new() -> Self {
        Self
    }
}

impl LineFilter for GeometricLengthFilter {
    fn name(&self) -> &'static str {
        "geometric-length"
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &[GEOLENFILTER_VALUE]
    }

    fn filter(
        &self,
        request: &Request,
        input: &TrajectoryEnsembleSelection,
    ) -> JetResult<TrajectoryEnsembleSelection> {
        let config = GeometricLengthFilterConfig::read_from(request)?;
        let vertices = input.vertices();

        let mut builder = SelectionBuilder::new();
        for ensemble in input.ensembles() {
            builder.begin_member(ensemble.member);
            for line in input.member_lines(ensemble) {
                if line_length_km(&vertices[line.indices()]) >= config.min_length_km {
                    builder.push_line(line.start, line.count);
                }
            }
        }
        builder.finish(Arc::clone(input.refers_to()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::fixtures::{lines, single_member_selection};

    fn request(min_length_km: f32) -> Request {
        let mut request = Request::new();
        GeometricLengthFilterConfig { min_length_km }.write_to(&mut request);
        request
    }

    #[test]
    fn test_keeps_or_drops_whole_lines() {
        // 4 degrees along the equator is ~445 km, 10 degrees ~1112 km.
        let input = single_member_selection(&[lines::STRAIGHT_EQUATOR, lines::DIVING_END]);
        let filter = GeometricLengthFilter::new();

        let output = filter.filter(&request(500.0), &input).unwrap();
        assert_eq!(output.lines(), &input.lines()[1..]);

        let output = filter.filter(&request(400.0), &input).unwrap();
        assert_eq!(output.lines(), input.lines());

        let output = filter.filter(&request(2000.0), &input).unwrap();
        assert_eq!(output.num_lines(), 0);
        assert_eq!(output.num_members(), 1);
    }
}
