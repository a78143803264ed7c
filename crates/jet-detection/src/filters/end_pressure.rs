//! End-pressure difference filter.

use jet_common::keys::{ENDPRESSUREDIFFFILTER_ANGLE, ENDPRESSUREDIFFFILTER_VALUE};
use jet_common::{JetResult, LineVertex, Request, TrajectoryEnsembleSelection};

use super::{resegment_lines, LineFilter};
use crate::config::{EndPressureDifferenceFilterConfig, RequestParameters};
use crate::geometry::turning_angle_deg;

/// Trims line endpoints whose first segment climbs or dives by more than
/// `ENDPRESSUREDIFFFILTER_VALUE` hPa, or bends away from the next segment
/// by more than `ENDPRESSUREDIFFFILTER_ANGLE` degrees.
///
/// Interior vertices and lines of two or fewer vertices always pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndPressureDifferenceFilter;

impl EndPressureDifferenceFilter {
    pub fn new() -> Self {
        Self
    }
}

fn end_passes(
    config: &EndPressureDifferenceFilterConfig,
    end: &LineVertex,
    next: &LineVertex,
    after_next: &LineVertex,
) -> bool {
    turning_angle_deg(end, next, after_next) <= config.max_angle_deg
        && (next.z - end.z).abs() <= config.max_pressure_difference_hpa
}

impl LineFilter for EndPressureDifferenceFilter {
    fn name(&self) -> &'static str {
        "end-pressure-difference"
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &[ENDPRESSUREDIFFFILTER_VALUE, ENDPRESSUREDIFFFILTER_ANGLE]
    }

    fn filter(
        &self,
        request: &Request,
        input: &TrajectoryEnsembleSelection,
    ) -> JetResult<TrajectoryEnsembleSelection> {
        let config = EndPressureDifferenceFilterConfig::read_from(request)?;
        resegment_lines(input, |points, j| {
            let n = points.len();
            if n <= 2 {
                return true;
            }
            if j == 0 {
                end_passes(&config, &points[0], &points[1], &points[2])
            } else if j == n - 1 {
                end_passes(&config, &points[n - 1], &points[n - 2], &points[n - 3])
            } else {
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jet_common::LineRange;
    use test_utils::fixtures::{line_vertices, lines, single_member_selection};

    fn request(max_pressure_difference_hpa: f32, max_angle_deg: f32) -> Request {
        let mut request = Request::new();
        EndPressureDifferenceFilterConfig {
            max_pressure_difference_hpa,
            max_angle_deg,
        }
        .write_to(&mut request);
        request
    }

    #[test]
    fn test_diving_end_is_trimmed() {
        let input = single_member_selection(&[lines::DIVING_END]);
        let filter = EndPressureDifferenceFilter::new();

        let output = filter.filter(&request(50.0, 30.0), &input).unwrap();
        assert_eq!(output.lines(), &[LineRange::new(0, 5)]);

        let output = filter.filter(&request(100.0, 30.0), &input).unwrap();
        assert_eq!(output.lines(), input.lines());
    }

    #[test]
    fn test_bent_start_is_trimmed() {
        let bent = line_vertices(&[
            (0.0, 1.0, 250.0),
            (1.0, 0.0, 250.0),
            (2.0, 0.0, 250.0),
            (3.0, 0.0, 250.0),
        ]);
        let input = test_utils::fixtures::ensemble_selection(&[(0, vec![bent])]);
        let output = EndPressureDifferenceFilter::new()
            .filter(&request(50.0, 30.0), &input)
            .unwrap();
        assert_eq!(output.lines(), &[LineRange::new(1, 3)]);
    }

    #[test]
    fn test_short_lines_pass() {
        let line: &[(f32, f32, f32)] = &[(0.0, 0.0, 250.0), (1.0, 0.0, 500.0)];
        let input = single_member_selection(&[line]);
        let output = EndPressureDifferenceFilter::new()
            .filter(&request(10.0, 0.0), &input)
            .unwrap();
        assert_eq!(output.lines(), input.lines());
    }
}
