//! jet-core detection CLI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use jetcore_cli::{run, write_lines, CliConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Parser, Debug)]
#[command(name = "jetcore-cli")]
#[command(about = "Detect jet-stream cores in a synthetic ensemble forecast")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "JETCORE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of ensemble members
    #[arg(short, long)]
    members: Option<u32>,

    /// Number of pressure levels between 1000 and 200 hPa
    #[arg(long)]
    levels: Option<usize>,

    /// Grid points in longitude
    #[arg(long)]
    nlon: Option<usize>,

    /// Grid points in latitude
    #[arg(long)]
    nlat: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "JETCORE_LOG_FORMAT")]
    log_format: LogFormat,

    /// Write the selected polylines as JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format);

    let mut config = CliConfig::load_or_default(args.config.as_deref())?;
    if let Some(members) = args.members {
        config.synthetic.members = members;
    }
    if let Some(levels) = args.levels {
        config.set_level_count(levels)?;
    }
    if let Some(nlon) = args.nlon {
        config.synthetic.nlon = nlon;
    }
    if let Some(nlat) = args.nlat {
        config.synthetic.nlat = nlat;
    }
    config.validate()?;

    info!(
        members = config.synthetic.members,
        grid = %format!(
            "{}x{}x{}",
            config.synthetic.nlon,
            config.synthetic.nlat,
            config.synthetic.levels_hpa.len()
        ),
        filters = config.jetcore.filters.len(),
        "Starting jet-core detection"
    );

    let output = run(&config).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&output.summaries).context("Failed to encode summary")?
    );
    if let Some(path) = &args.output {
        write_lines(path, &output.lines)?;
        info!(path = %path.display(), "Wrote polylines");
    }

    Ok(())
}
