//! Pipeline execution and result summaries.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jet_common::{
    StructuredGrid, TrajectoryArrowHeads, TrajectoryEnsembleSelection, TrajectoryValues,
};
use jet_detection::geometry::line_length_km;
use jet_detection::{JetCorePipeline, SyntheticJetReader, WeatherPredictionSource};
use serde::{Deserialize, Serialize};
use task_graph::{FileAccess, MemoryManager, MultiThreadScheduler, SharedSource};
use tracing::info;

use crate::config::CliConfig;

/// Jet cores found for one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub member: u32,
    pub lines: usize,
    pub vertices: usize,
    pub total_length_km: f32,
}

/// Jet cores of one forecast time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastSummary {
    pub init_time: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub members: Vec<MemberSummary>,
}

/// Arrow head on one polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrow {
    pub position: [f32; 3],
    pub direction: [f32; 2],
    pub value: f32,
}

/// Selected polylines of one member as (lon, lat, p_hpa) points, with the
/// colour value of every point and one arrow per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberLines {
    pub member: u32,
    pub lines: Vec<Vec<[f32; 3]>>,
    pub values: Vec<Vec<f32>>,
    pub arrows: Vec<Arrow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastLines {
    pub valid_time: DateTime<Utc>,
    pub members: Vec<MemberLines>,
}

/// Everything one run produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub summaries: Vec<ForecastSummary>,
    pub lines: Vec<ForecastLines>,
}

pub fn summarize(selection: &TrajectoryEnsembleSelection) -> Vec<MemberSummary> {
    selection
        .ensembles()
        .iter()
        .map(|ensemble| {
            let lines = selection.member_lines(ensemble);
            MemberSummary {
                member: ensemble.member,
                lines: lines.len(),
                vertices: lines.iter().map(|line| line.count).sum(),
                total_length_km: lines
                    .iter()
                    .map(|line| line_length_km(&selection.vertices()[line.indices()]))
                    .sum(),
            }
        })
        .collect()
}

pub fn member_lines(
    selection: &TrajectoryEnsembleSelection,
    values: &TrajectoryValues,
    arrows: &TrajectoryArrowHeads,
) -> Vec<MemberLines> {
    selection
        .ensembles()
        .iter()
        .map(|ensemble| {
            let indices = ensemble.start..ensemble.start + ensemble.count;
            MemberLines {
                member: ensemble.member,
                lines: selection
                    .member_lines(ensemble)
                    .iter()
                    .map(|line| {
                        selection.vertices()[line.indices()]
                            .iter()
                            .map(|v| [v.x, v.y, v.z])
                            .collect()
                    })
                    .collect(),
                values: indices
                    .clone()
                    .map(|n| values.line(n).iter().map(|s| s.value).collect())
                    .collect(),
                arrows: indices
                    .filter_map(|n| arrows.heads().get(n))
                    .map(|head| Arrow {
                        position: [head.position.x, head.position.y, head.position.z],
                        direction: [head.direction.x, head.direction.y],
                        value: head.value,
                    })
                    .collect(),
            }
        })
        .collect()
}

/// Run the pipeline on the configured synthetic ensemble, one request per
/// valid time, through the multi-thread scheduler.
pub async fn run(config: &CliConfig) -> Result<RunOutput> {
    let jet = &config.synthetic;
    let pipeline_config = &config.jetcore.pipeline;

    let memory = MemoryManager::new("jetcore-cli", pipeline_config.memory_limit_kb());
    let source: SharedSource<StructuredGrid> = Arc::new(WeatherPredictionSource::new(
        SyntheticJetReader::new(jet.clone()),
        Arc::new(FileAccess::new("synthetic")),
        Arc::clone(&memory),
    ));
    let scheduler = MultiThreadScheduler::from_config(pipeline_config)
        .context("Failed to start scheduler")?;
    let pipeline = JetCorePipeline::builder()
        .data_source(source)
        .memory_manager(memory)
        .scheduler(Arc::new(scheduler))
        .config(config.jetcore.clone())
        .build()
        .context("Failed to build pipeline")?;

    let members: BTreeSet<u32> = (0..jet.members).collect();
    let mut output = RunOutput::default();
    for valid_time in jet.valid_times() {
        let request = pipeline.compose_request(&jet.init_time, &valid_time, &members);
        let selection = pipeline
            .compute(&request)
            .await
            .with_context(|| format!("Pipeline failed for {}", valid_time))?;

        let values = pipeline
            .get_values(&request)
            .with_context(|| format!("Value sampling failed for {}", valid_time))?;
        let arrows = pipeline
            .get_arrow_heads(&request)
            .with_context(|| format!("Arrow heads failed for {}", valid_time))?;

        let summary = summarize(&selection);
        info!(
            valid_time = %valid_time,
            lines = selection.num_lines(),
            vertices = selection.num_vertices(),
            "Detected jet cores"
        );
        output.lines.push(ForecastLines {
            valid_time,
            members: member_lines(&selection, &values, &arrows),
        });
        output.summaries.push(ForecastSummary {
            init_time: jet.init_time,
            valid_time,
            members: summary,
        });
        pipeline.release_data(selection);
    }

    let stats = pipeline.memory().stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        evictions = stats.evictions,
        memory_usage_kb = stats.memory_usage_kb,
        "Cache statistics"
    );
    Ok(output)
}

/// Write polylines as pretty-printed JSON.
pub fn write_lines<P: AsRef<Path>>(path: P, lines: &[ForecastLines]) -> Result<()> {
    let json = serde_json::to_string_pretty(lines)?;
    fs::write(path.as_ref(), json)
        .with_context(|| format!("Failed to write lines to {:?}", path.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jet_common::{ArrowHead, IntersectionLines, LineVertex, SelectionBuilder, VertexSample};
    use nalgebra::Vector2;

    fn selection() -> TrajectoryEnsembleSelection {
        let vertices: Vec<LineVertex> = (0..4)
            .map(|i| LineVertex::new(i as f32, 0.0, 250.0))
            .collect();
        let mut builder = SelectionBuilder::new();
        builder.begin_member(0);
        builder.begin_member(3);
        builder.push_line(0, 4);
        builder.finish(Arc::new(IntersectionLines::new(vertices))).unwrap()
    }

    #[test]
    fn test_summarize_counts_per_member() {
        let summary = summarize(&selection());
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].lines, 0);
        assert_eq!(summary[0].total_length_km, 0.0);
        assert_eq!(summary[1].member, 3);
        assert_eq!(summary[1].vertices, 4);
        assert!((summary[1].total_length_km - 333.6).abs() < 1.0);
    }

    #[test]
    fn test_member_lines_points() {
        let selection = selection();
        let mut values = TrajectoryValues::default();
        values.push_line(selection.vertices().iter().map(|v| VertexSample {
            value: v.x * 10.0,
            thickness: 0.0,
        }));
        let arrows = TrajectoryArrowHeads::new(vec![ArrowHead {
            position: selection.vertices()[3],
            direction: Vector2::new(1.0, 0.0),
            value: 30.0,
        }]);

        let lines = member_lines(&selection, &values, &arrows);
        assert!(lines[0].lines.is_empty());
        assert!(lines[0].values.is_empty());
        assert!(lines[0].arrows.is_empty());
        assert_eq!(lines[1].lines[0][2], [2.0, 0.0, 250.0]);
        assert_eq!(lines[1].values[0], vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(lines[1].arrows[0].position, [3.0, 0.0, 250.0]);
        assert_eq!(lines[1].arrows[0].direction, [1.0, 0.0]);
    }
}
