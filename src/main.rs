//! pcapstitch CLI entry point.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pcapstitch::cli::{self, Args, StreamWriter};
use pcapstitch_core::{PcapReader, StreamManager};

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let props = args.properties().context("Failed to load configuration")?;

    // Set up logging
    let filter = args.log_filter(&props);
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = args
        .stream_config(&props)
        .context("Invalid stream configuration")?;
    let key_path = config.private_key_path.clone();
    let manager = StreamManager::from_config(config).with_context(|| match &key_path {
        Some(path) => format!("Failed to load private keys from {}", path.display()),
        None => "Failed to initialize stream manager".to_string(),
    })?;

    let reader = PcapReader::open(&args.file)
        .with_context(|| format!("Failed to open capture file: {}", args.file.display()))?;

    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = StreamWriter::new(BufWriter::new(sink), args.format);

    let summary = cli::run(reader, &manager, &mut writer)?;
    for line in summary.format_summary().lines() {
        tracing::info!("{}", line);
    }

    match &args.round_trips {
        Some(path) => {
            let mut out = BufWriter::new(File::create(path).with_context(|| {
                format!("Failed to create round trip file: {}", path.display())
            })?);
            for round_trip in &summary.round_trips {
                writeln!(out, "{}", round_trip.to_message())?;
            }
            out.flush()
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => {
            for round_trip in &summary.round_trips {
                tracing::info!("{}", round_trip.to_message());
            }
        }
    }

    Ok(())
}
