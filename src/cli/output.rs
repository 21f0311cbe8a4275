//! Stream output framing.

use std::io::{self, Write};

use clap::ValueEnum;
use pcapstitch_core::ReconstructedStream;

/// How reconstructed streams are framed on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Streams back to back (default)
    Raw,
    /// 4-byte big-endian length before each stream
    LengthPrefixed,
}

/// Writes reconstructed streams to a sink.
pub struct StreamWriter<W: Write> {
    writer: W,
    format: OutputFormat,
    streams: u64,
    bytes: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            writer,
            format,
            streams: 0,
            bytes: 0,
        }
    }

    /// Write one stream: metadata header followed by its payload.
    pub fn write_stream(&mut self, stream: &ReconstructedStream) -> io::Result<()> {
        let data = stream.to_bytes();
        if self.format == OutputFormat::LengthPrefixed {
            let len = u32::try_from(data.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "stream exceeds 4 GiB")
            })?;
            self.writer.write_all(&len.to_be_bytes())?;
        }
        self.writer.write_all(&data)?;

        self.streams += 1;
        self.bytes += data.len() as u64;
        Ok(())
    }

    pub fn streams_written(&self) -> u64 {
        self.streams
    }

    /// Stream bytes written, excluding length prefixes.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcapstitch_core::packet::test_utils::Conversation;
    use pcapstitch_core::{StreamConfig, StreamManager};

    fn sample_stream() -> ReconstructedStream {
        let manager = StreamManager::new(StreamConfig::default());
        let mut conv = Conversation::new(([10, 0, 0, 1], 40000), ([10, 0, 0, 2], 80), 100, 900);

        let mut frames = conv.handshake();
        frames.push(conv.client_data(b"ping"));
        frames.push(conv.server_data(b"pong"));
        frames.push(conv.client_fin());
        frames.push(conv.server_fin());

        frames
            .iter()
            .enumerate()
            .find_map(|(i, f)| manager.process_frame(f, i as i64))
            .unwrap()
    }

    // Test 1: Raw framing writes the stream bytes verbatim
    #[test]
    fn test_raw_output() {
        let stream = sample_stream();
        let mut writer = StreamWriter::new(Vec::new(), OutputFormat::Raw);
        writer.write_stream(&stream).unwrap();

        assert_eq!(writer.streams_written(), 1);
        assert_eq!(writer.bytes_written(), stream.to_bytes().len() as u64);
        assert_eq!(writer.into_inner(), stream.to_bytes().to_vec());
    }

    // Test 2: Length-prefixed framing
    #[test]
    fn test_length_prefixed_output() {
        let stream = sample_stream();
        let expected = stream.to_bytes();
        let mut writer = StreamWriter::new(Vec::new(), OutputFormat::LengthPrefixed);
        writer.write_stream(&stream).unwrap();
        writer.write_stream(&stream).unwrap();

        let out = writer.into_inner();
        assert_eq!(out.len(), 2 * (4 + expected.len()));
        let len = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        assert_eq!(len, expected.len());
        assert_eq!(&out[4..4 + len], expected.as_ref());
    }
}
