//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap
//! - Driving a capture through the stream manager
//! - Stream output framing

mod args;
mod output;
mod pipeline;

pub use args::Args;
pub use output::{OutputFormat, StreamWriter};
pub use pipeline::{run, PipelineSummary};
