//! Integration tests for the per-vertex value and arrow-head stages.
//!
//! Fields are linear in longitude and latitude and constant in pressure,
//! so interpolated values are exact.

use std::collections::BTreeSet;
use std::sync::Arc;

use jet_common::keys::{
    ARROWHEADS_MEMBERS, INIT_TIME, LEVELTYPE, MEMBERS, TRAJECTORYVALUES_MEMBERS, VALID_TIME,
};
use jet_common::{
    JetError, JetResult, LineVertex, Request, StructuredGrid, TrajectoryEnsembleSelection,
};
use jet_detection::{
    ArrowHeadsConfig, InMemoryReader, RequestParameters, SelectionSource,
    TrajectoryArrowHeadsSource, TrajectoryValueSource, TrajectoryValuesConfig,
    WeatherPredictionSource,
};
use nalgebra::Vector2;
use task_graph::{
    get_task_graph, key_set, FileAccess, MemoryManager, ScheduledDataSource, SharedSource,
    SourceCore, Task,
};
use test_utils::assert_approx_eq;
use test_utils::fixtures::{ensemble_selection, line_vertices, test_init_time, test_valid_time};
use test_utils::generators::{grid_on_axes, regular_pressure_axis, test_field_info};

fn speed(lon: f32, lat: f32) -> f32 {
    50.0 + 2.0 * lon + lat
}

fn width(lat: f32) -> f32 {
    3.0 * lat
}

/// `speed`, `width` and westerly (`u`, `v`) or easterly (`u_east`) wind
/// for members 0 and 1 on a 10° x 10° raster.
fn reader() -> InMemoryReader {
    let fields: [(&str, fn(f32, f32) -> f32); 5] = [
        ("speed", speed),
        ("width", |_, lat| width(lat)),
        ("u", |_, _| 10.0),
        ("v", |_, _| 0.0),
        ("u_east", |_, _| -10.0),
    ];
    let mut reader = InMemoryReader::new();
    for member in [0, 1] {
        for (variable, f) in fields {
            reader.insert(grid_on_axes(
                test_field_info(variable, member),
                (0..10).map(|i| i as f32).collect(),
                (0..10).map(|j| j as f32).collect(),
                regular_pressure_axis(8, 100.0),
                |lon, lat, _| f(lon, lat),
            ));
        }
    }
    reader
}

/// Serves one fixed selection for any request naming `MEMBERS`.
struct FixedSelectionSource {
    core: SourceCore,
    selection: TrajectoryEnsembleSelection,
}

impl ScheduledDataSource for FixedSelectionSource {
    type Output = TrajectoryEnsembleSelection;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &[MEMBERS]
    }

    fn required_keys(&self) -> BTreeSet<String> {
        key_set(&[MEMBERS])
    }

    fn create_task_graph(&self, _request: &Request, _task: &mut Task) -> JetResult<()> {
        Ok(())
    }

    fn produce_data(&self, _request: &Request) -> JetResult<TrajectoryEnsembleSelection> {
        Ok(self.selection.clone())
    }
}

/// Member 0 runs east along 2° N, member 1 runs west along 7° N.
fn selection() -> TrajectoryEnsembleSelection {
    ensemble_selection(&[
        (
            0,
            vec![line_vertices(&[
                (1.5, 2.0, 500.0),
                (3.5, 2.0, 500.0),
                (5.0, 2.5, 500.0),
            ])],
        ),
        (
            1,
            vec![line_vertices(&[
                (6.0, 7.0, 400.0),
                (4.0, 7.0, 400.0),
                (2.0, 6.0, 400.0),
            ])],
        ),
    ])
}

struct Fixture {
    values: SharedSource<jet_common::TrajectoryValues>,
    arrows: SharedSource<jet_common::TrajectoryArrowHeads>,
}

fn fixture(selection: TrajectoryEnsembleSelection) -> Fixture {
    let memory = MemoryManager::with_limit_mb("output-test", 64);
    let grids: SharedSource<StructuredGrid> = Arc::new(WeatherPredictionSource::new(
        reader(),
        Arc::new(FileAccess::new("memory")),
        Arc::clone(&memory),
    ));
    let lines: SelectionSource = Arc::new(FixedSelectionSource {
        core: SourceCore::new("fixed-selection", Arc::clone(&memory)),
        selection,
    });
    Fixture {
        values: Arc::new(TrajectoryValueSource::new(
            Arc::clone(&lines),
            Arc::clone(&grids),
            Arc::clone(&memory),
        )),
        arrows: Arc::new(TrajectoryArrowHeadsSource::new(lines, grids, memory)),
    }
}

fn request() -> Request {
    let mut request = Request::new();
    request.insert(LEVELTYPE, "pressure_levels");
    request.insert_time(INIT_TIME, &test_init_time());
    request.insert_time(VALID_TIME, &test_valid_time());
    request.insert(MEMBERS, "0/1");
    request.insert(TRAJECTORYVALUES_MEMBERS, "0/1");
    request.insert(ARROWHEADS_MEMBERS, "0/1");
    TrajectoryValuesConfig {
        variable: Some("speed".to_string()),
        thickness_variable: Some("width".to_string()),
    }
    .write_to(&mut request);
    ArrowHeadsConfig {
        wind_variables: ["u".to_string(), "v".to_string()],
        variable: Some("speed".to_string()),
    }
    .write_to(&mut request);
    request
}

// =============================================================================
// Per-vertex Values
// =============================================================================

#[test]
fn test_values_sample_analytic_field() {
    let fixture = fixture(selection());
    let values = fixture.values.get_data(&request()).unwrap();

    let selection = selection();
    assert_eq!(values.num_lines(), selection.num_lines());
    assert_eq!(values.samples().len(), selection.num_vertices());
    for (line, range) in values.lines().zip(selection.lines()) {
        let vertices = &selection.vertices()[range.indices()];
        assert_eq!(line.len(), vertices.len());
        for (sample, v) in line.iter().zip(vertices) {
            assert_approx_eq!(sample.value, speed(v.x, v.y), 1e-3);
            assert_approx_eq!(sample.thickness, width(v.y), 1e-3);
        }
    }
}

#[test]
fn test_unset_variables_sample_zero() {
    let fixture = fixture(selection());
    let mut request = request();
    TrajectoryValuesConfig {
        variable: Some("speed".to_string()),
        thickness_variable: None,
    }
    .write_to(&mut request);

    let values = fixture.values.get_data(&request).unwrap();
    assert!(values.samples().iter().all(|s| s.thickness == 0.0));
    assert_approx_eq!(values.line(1)[0].value, speed(6.0, 7.0), 1e-3);
}

#[test]
fn test_vertex_outside_field_is_nan() {
    let line: Vec<LineVertex> = line_vertices(&[(8.0, 2.0, 500.0), (12.0, 2.0, 500.0)]);
    let fixture = fixture(ensemble_selection(&[(0, vec![line])]));
    let mut request = request();
    request.insert(MEMBERS, "0");

    let values = fixture.values.get_data(&request).unwrap();
    assert_approx_eq!(values.line(0)[0].value, speed(8.0, 2.0), 1e-3);
    assert!(values.line(0)[1].value.is_nan());
}

#[test]
fn test_member_missing_from_values_key_fails() {
    let fixture = fixture(selection());
    let mut request = request();
    request.insert(TRAJECTORYVALUES_MEMBERS, "0");

    assert!(matches!(
        fixture.values.get_data(&request),
        Err(JetError::InvalidValue { .. })
    ));
}

#[test]
fn test_value_task_graph_fetches_each_member_field() {
    let fixture = fixture(selection());
    let graph = get_task_graph(&fixture.values, &request()).unwrap();
    // Two fields per member plus the selection.
    assert_eq!(graph.num_pending_tasks(), 1 + 2 * 2 + 1);
}

// =============================================================================
// Arrow Heads
// =============================================================================

#[test]
fn test_arrow_heads_point_downstream() {
    let fixture = fixture(selection());
    let heads = fixture.arrows.get_data(&request()).unwrap();
    assert_eq!(heads.len(), 2);

    // Eastward line in a westerly: arrow on its eastern end.
    let east = &heads.heads()[0];
    assert_eq!(east.position, LineVertex::new(5.0, 2.5, 500.0));
    assert!((east.direction - Vector2::new(1.5, 0.5).normalize()).norm() < 1e-6);
    assert_approx_eq!(east.value, speed(5.0, 2.5), 1e-3);

    // Westward line: arrow on its first vertex, pointing back east.
    let west = &heads.heads()[1];
    assert_eq!(west.position, LineVertex::new(6.0, 7.0, 400.0));
    assert!((west.direction - Vector2::new(1.0, 0.0)).norm() < 1e-6);
    assert_approx_eq!(west.value, speed(6.0, 7.0), 1e-3);
}

#[test]
fn test_arrow_heads_follow_wind_reversal() {
    let fixture = fixture(selection());
    let mut request = request();
    ArrowHeadsConfig {
        wind_variables: ["u_east".to_string(), "v".to_string()],
        variable: None,
    }
    .write_to(&mut request);

    let heads = fixture.arrows.get_data(&request).unwrap();
    let east = &heads.heads()[0];
    assert_eq!(east.position, LineVertex::new(1.5, 2.0, 500.0));
    assert!((east.direction - Vector2::new(-1.0, 0.0)).norm() < 1e-6);
    assert_eq!(east.value, 0.0);

    let west = &heads.heads()[1];
    assert_eq!(west.position, LineVertex::new(2.0, 6.0, 400.0));
}

#[test]
fn test_unknown_wind_variable_fails() {
    let fixture = fixture(selection());
    let mut request = request();
    ArrowHeadsConfig {
        wind_variables: ["gust".to_string(), "v".to_string()],
        variable: None,
    }
    .write_to(&mut request);

    assert!(fixture.arrows.get_data(&request).is_err());
}
