//! Command-line driver for the jet-core detection pipeline.
//!
//! Runs the pipeline on a synthetic ensemble jet field and reports the
//! detected cores per member, with wind speed along each core and an
//! arrow head in flow direction.

pub mod config;
pub mod run;

pub use config::CliConfig;
pub use run::{
    run, write_lines, Arrow, ForecastLines, ForecastSummary, MemberLines, MemberSummary, RunOutput,
};
