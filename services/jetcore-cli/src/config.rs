//! Run configuration for the jet-core CLI.
//!
//! A YAML file holds the synthetic ensemble and the pipeline settings:
//!
//! ```yaml
//! synthetic:
//!   members: 5
//!   lead_hours: [12, 24]
//! jetcore:
//!   filters:
//!     - type: angle
//!       max_angle_deg: 45
//!   pipeline:
//!     cpu_workers: ${JETCORE_CPU_WORKERS:-4}
//! ```
//!
//! Both sections are optional. `${VAR}` and `${VAR:-default}` are expanded
//! from the environment before parsing.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use jet_detection::{JetCoreConfig, SyntheticJet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub synthetic: SyntheticJet,

    #[serde(default)]
    pub jetcore: JetCoreConfig,
}

impl CliConfig {
    /// Load and validate a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config from {:?}", path.as_ref()))?;
        let expanded = expand_env_vars(&content)?;
        let config: CliConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config from {:?}", path.as_ref()))?;
        config.validate()?;
        Ok(config)
    }

    /// The file at `path`, or the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Regenerate `n` pressure levels evenly spaced from 1000 to 200 hPa.
    pub fn set_level_count(&mut self, n: usize) -> Result<()> {
        anyhow::ensure!(n >= 2, "at least two pressure levels are needed, got {}", n);
        let step = 800.0 / (n - 1) as f32;
        self.synthetic.levels_hpa = (0..n).map(|k| 1000.0 - step * k as f32).collect();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let jet = &self.synthetic;
        anyhow::ensure!(jet.members > 0, "synthetic ensemble needs at least one member");
        anyhow::ensure!(
            jet.nlon >= 2 && jet.nlat >= 2,
            "synthetic grid must be at least 2x2, got {}x{}",
            jet.nlon,
            jet.nlat
        );
        anyhow::ensure!(
            jet.levels_hpa.len() >= 2,
            "synthetic grid needs at least two pressure levels"
        );
        anyhow::ensure!(!jet.lead_hours.is_empty(), "no lead times configured");
        anyhow::ensure!(jet.spacing_deg > 0.0, "grid spacing must be positive");

        self.jetcore
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid pipeline config: {}", e))
    }
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` in `content`.
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();

        let mut expr = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => expr.push(c),
                None => anyhow::bail!("Unclosed variable substitution: ${{{}", expr),
            }
        }
        result.push_str(&resolve_var_expr(&expr)?);
    }

    Ok(result)
}

fn resolve_var_expr(expr: &str) -> Result<String> {
    match expr.split_once(":-") {
        Some((name, default)) => match std::env::var(name.trim()) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Ok(default.to_string()),
        },
        None => std::env::var(expr.trim())
            .with_context(|| format!("Environment variable {} not set", expr)),
    }
}
