//! Integration tests for config loading and pipeline runs.

use std::io::Write;

use jetcore_cli::{run, write_lines, CliConfig, ForecastLines};
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

fn small_config() -> CliConfig {
    let mut config = CliConfig::default();
    config.synthetic.members = 2;
    config.synthetic.nlon = 31;
    config.jetcore.pipeline.cpu_workers = 2;
    config.jetcore.pipeline.disk_workers = 1;
    config.jetcore.pipeline.memory_limit_mb = 256;
    config
}

// =============================================================================
// Config Loading
// =============================================================================

#[test]
fn test_load_partial_config() {
    let file = config_file(
        r#"
synthetic:
  members: 4
  lead_hours: [6, 12]
jetcore:
  filters:
    - type: angle
      max_angle_deg: 30
    - type: geometric_length
      min_length_km: 1000
"#,
    );
    let config = CliConfig::load(file.path()).unwrap();
    assert_eq!(config.synthetic.members, 4);
    assert_eq!(config.synthetic.valid_times().len(), 2);
    assert_eq!(config.synthetic.nlon, 61);
    assert_eq!(config.jetcore.filters.len(), 2);
    assert_eq!(config.jetcore.filters[1].name(), "geometric_length");
    assert!(config.jetcore.blur.is_none());
}

#[test]
fn test_load_expands_environment() {
    std::env::set_var("JETCORE_CLI_TEST_WORKERS", "3");
    let file = config_file(
        r#"
jetcore:
  pipeline:
    cpu_workers: ${JETCORE_CLI_TEST_WORKERS}
    memory_limit_mb: ${JETCORE_CLI_TEST_UNSET_LIMIT:-128}
"#,
    );
    let config = CliConfig::load(file.path()).unwrap();
    assert_eq!(config.jetcore.pipeline.cpu_workers, 3);
    assert_eq!(config.jetcore.pipeline.memory_limit_mb, 128);
}

#[test]
fn test_load_rejects_invalid_config() {
    let duplicate = config_file(
        r#"
jetcore:
  filters:
    - type: angle
      max_angle_deg: 30
    - type: angle
      max_angle_deg: 45
"#,
    );
    assert!(CliConfig::load(duplicate.path()).is_err());

    let no_members = config_file("synthetic:\n  members: 0\n");
    assert!(CliConfig::load(no_members.path()).is_err());

    let malformed = config_file("synthetic: [not, a, map]\n");
    assert!(CliConfig::load(malformed.path()).is_err());

    assert!(CliConfig::load("/nonexistent/jetcore.yaml").is_err());
}

// =============================================================================
// Pipeline Runs
// =============================================================================

#[tokio::test]
async fn test_run_reports_every_member() {
    let config = small_config();
    let output = run(&config).await.unwrap();

    assert_eq!(output.summaries.len(), 1);
    let summary = &output.summaries[0];
    assert_eq!(summary.valid_time, config.synthetic.valid_times()[0]);
    assert_eq!(summary.members.len(), 2);
    for member in &summary.members {
        assert!(member.lines >= 1, "member {} has no core", member.member);
        assert!(member.total_length_km > 500.0);
    }
}

#[tokio::test]
async fn test_run_writes_polylines() {
    let config = small_config();
    let output = run(&config).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lines.json");
    write_lines(&path, &output.lines).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<ForecastLines> = serde_json::from_str(&content).unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].members.len(), 2);
    let summary = &output.summaries[0].members[0];
    let points: usize = lines[0].members[0].lines.iter().map(Vec::len).sum();
    assert_eq!(points, summary.vertices);

    for member in &lines[0].members {
        assert_eq!(member.values.len(), member.lines.len());
        assert_eq!(member.arrows.len(), member.lines.len());
        for (line, values) in member.lines.iter().zip(&member.values) {
            assert_eq!(line.len(), values.len());
            // Cores run through the wind maximum.
            assert!(values.iter().all(|speed| *speed > 10.0));
        }
    }
}
