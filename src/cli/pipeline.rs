//! Capture-to-streams pipeline.
//!
//! Feeds every frame of a capture into a [`StreamManager`] in file order,
//! sweeps idle connections as capture time advances, drains what is left at
//! end of file and hands each reconstructed stream to a [`StreamWriter`].

use std::io::{Read, Write};

use anyhow::{Context, Result};
use pcapstitch_core::pcap::LINKTYPE_ETHERNET;
use pcapstitch_core::{PcapError, PcapReader, RoundTrip, SessionCacheStats, StreamManager};

use super::StreamWriter;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub streams_written: u64,
    pub bytes_written: u64,
    pub cache: SessionCacheStats,
    pub round_trips: Vec<RoundTrip>,
}

impl PipelineSummary {
    pub fn format_summary(&self) -> String {
        format!(
            "Frames read:     {} ({} skipped)\n\
             Streams written: {} ({} bytes)\n\
             Round trips:     {}\n\
             {}",
            self.frames_read,
            self.frames_skipped,
            self.streams_written,
            self.bytes_written,
            self.round_trips.len(),
            self.cache.format_summary()
        )
    }
}

/// Run a whole capture through `manager`, writing streams to `writer`.
pub fn run<R: Read, W: Write>(
    reader: PcapReader<R>,
    manager: &StreamManager,
    writer: &mut StreamWriter<W>,
) -> Result<PipelineSummary> {
    let idle_timeout_us = manager.config().idle_timeout_us;
    let mut last_sweep_us: Option<i64> = None;

    for frame in reader {
        let frame = frame.context("Failed to read capture")?;
        if frame.link_type != LINKTYPE_ETHERNET {
            return Err(PcapError::UnsupportedLinkType {
                link_type: frame.link_type,
            }
            .into());
        }

        if let Some(stream) = manager.process_frame(&frame.data, frame.timestamp_us) {
            writer.write_stream(&stream)?;
        }

        let now = frame.timestamp_us;
        match last_sweep_us {
            Some(last) if now - last < idle_timeout_us => {}
            Some(_) => {
                for stream in manager.sweep(now) {
                    writer.write_stream(&stream)?;
                }
                last_sweep_us = Some(now);
            }
            None => last_sweep_us = Some(now),
        }
    }

    for stream in manager.drain() {
        writer.write_stream(&stream)?;
    }
    writer.flush().context("Failed to flush output")?;

    let summary = PipelineSummary {
        frames_read: manager.frames_processed(),
        frames_skipped: manager.frames_skipped(),
        streams_written: writer.streams_written(),
        bytes_written: writer.bytes_written(),
        cache: manager.stats(),
        round_trips: manager.take_round_trips(),
    };
    tracing::debug!(
        frames = summary.frames_read,
        streams = summary.streams_written,
        "Capture processed"
    );
    Ok(summary)
}
