//! Capture file reader.
//!
//! [`PcapReader`] reads legacy PCAP (micro- and nanosecond, either byte
//! order) and PCAPNG files through the `pcap_parser` crate and yields owned
//! frames with their capture timestamps in microseconds.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError as ParserError, PcapNGReader};

use crate::error::{Error, PcapError};

/// Buffer size for pcap_parser readers (256KB).
const BUFFER_SIZE: usize = 262144;

/// Ethernet link type.
pub const LINKTYPE_ETHERNET: u16 = 1;

/// Format of the capture file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcapFormat {
    /// Classic PCAP, microsecond timestamps
    LegacyMicro,
    /// Classic PCAP, nanosecond timestamps
    LegacyNano,
    PcapNg,
}

impl PcapFormat {
    /// Detect the format from the first four bytes of a file.
    pub fn detect(data: &[u8]) -> Result<Self, Error> {
        let magic: [u8; 4] = data
            .get(..4)
            .and_then(|m| m.try_into().ok())
            .ok_or_else(|| invalid("Data too small for PCAP magic".to_string()))?;

        match u32::from_le_bytes(magic) {
            0xa1b2c3d4 | 0xd4c3b2a1 => Ok(PcapFormat::LegacyMicro),
            0xa1b23c4d | 0x4d3cb2a1 => Ok(PcapFormat::LegacyNano),
            0x0a0d0d0a => Ok(PcapFormat::PcapNg),
            other => Err(invalid(format!("Unknown PCAP magic: 0x{:08x}", other))),
        }
    }
}

/// One captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// 1-based position in the file.
    pub frame_number: u64,
    pub timestamp_us: i64,
    pub link_type: u16,
    pub data: Bytes,
}

enum ReaderInner<R: Read> {
    Legacy(LegacyPcapReader<BufReader<R>>),
    Ng(PcapNGReader<BufReader<R>>),
}

/// Reader for PCAP and PCAPNG files.
///
/// # Example
///
/// ```no_run
/// use pcapstitch_core::pcap::PcapReader;
///
/// let mut reader = PcapReader::open("capture.pcap")?;
/// while let Some(frame) = reader.next_frame()? {
///     println!("Frame {}: {} bytes", frame.frame_number, frame.data.len());
/// }
/// # Ok::<(), pcapstitch_core::Error>(())
/// ```
pub struct PcapReader<R: Read = File> {
    inner: ReaderInner<R>,
    format: PcapFormat,
    frame_number: u64,
    link_type: u16,
}

impl PcapReader<File> {
    /// Open a capture file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|_| {
            Error::Pcap(PcapError::FileNotFound {
                path: path.display().to_string(),
            })
        })?;
        Self::new(file)
    }
}

impl<R: Read + Seek> PcapReader<R> {
    /// Read a capture from a seekable source positioned at its start.
    pub fn new(mut source: R) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        source
            .read_exact(&mut magic)
            .map_err(|_| invalid("File too short to read magic number".to_string()))?;
        let format = PcapFormat::detect(&magic)?;
        source.seek(SeekFrom::Start(0))?;

        let buf_reader = BufReader::with_capacity(BUFFER_SIZE, source);
        let inner = match format {
            PcapFormat::PcapNg => ReaderInner::Ng(
                PcapNGReader::new(BUFFER_SIZE, buf_reader)
                    .map_err(|e| invalid(format!("Failed to parse PCAPNG: {}", e)))?,
            ),
            PcapFormat::LegacyMicro | PcapFormat::LegacyNano => ReaderInner::Legacy(
                LegacyPcapReader::new(BUFFER_SIZE, buf_reader)
                    .map_err(|e| invalid(format!("Failed to parse legacy PCAP: {}", e)))?,
            ),
        };

        Ok(Self {
            inner,
            format,
            frame_number: 0,
            link_type: LINKTYPE_ETHERNET,
        })
    }
}

impl<R: Read> PcapReader<R> {
    pub fn format(&self) -> PcapFormat {
        self.format
    }

    /// Link type from the most recent file or interface header.
    pub fn link_type(&self) -> u16 {
        self.link_type
    }

    /// Frames read so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` at end of file.
    pub fn next_frame(&mut self) -> Result<Option<CapturedFrame>, Error> {
        let nanosecond = self.format == PcapFormat::LegacyNano;
        match &mut self.inner {
            ReaderInner::Legacy(reader) => {
                read_legacy(reader, nanosecond, &mut self.frame_number, &mut self.link_type)
            }
            ReaderInner::Ng(reader) => {
                read_pcapng(reader, &mut self.frame_number, &mut self.link_type)
            }
        }
    }
}

impl<R: Read> Iterator for PcapReader<R> {
    type Item = Result<CapturedFrame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn read_legacy<S: Read>(
    reader: &mut LegacyPcapReader<S>,
    nanosecond: bool,
    frame_number: &mut u64,
    link_type: &mut u16,
) -> Result<Option<CapturedFrame>, Error> {
    loop {
        match reader.next() {
            Ok((offset, block)) => match block {
                PcapBlockOwned::Legacy(packet) => {
                    *frame_number += 1;

                    let fraction = if nanosecond {
                        i64::from(packet.ts_usec) / 1000
                    } else {
                        i64::from(packet.ts_usec)
                    };
                    let frame = CapturedFrame {
                        frame_number: *frame_number,
                        timestamp_us: i64::from(packet.ts_sec) * 1_000_000 + fraction,
                        link_type: *link_type,
                        data: Bytes::copy_from_slice(packet.data),
                    };

                    reader.consume(offset);
                    return Ok(Some(frame));
                }
                PcapBlockOwned::LegacyHeader(header) => {
                    *link_type = header.network.0 as u16;
                    reader.consume(offset);
                }
                _ => reader.consume(offset),
            },
            Err(ParserError::Eof) => return Ok(None),
            Err(ParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("Legacy PCAP refill error: {}", e)))?;
            }
            Err(e) => return Err(invalid(format!("Legacy PCAP parse error: {}", e))),
        }
    }
}

fn read_pcapng<S: Read>(
    reader: &mut PcapNGReader<S>,
    frame_number: &mut u64,
    link_type: &mut u16,
) -> Result<Option<CapturedFrame>, Error> {
    use pcap_parser::pcapng::Block;

    loop {
        match reader.next() {
            Ok((offset, block)) => match block {
                PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                    *link_type = idb.linktype.0 as u16;
                    reader.consume(offset);
                }
                PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                    *frame_number += 1;

                    // Default interface resolution is microseconds
                    let frame = CapturedFrame {
                        frame_number: *frame_number,
                        timestamp_us: (i64::from(epb.ts_high) << 32) | i64::from(epb.ts_low),
                        link_type: *link_type,
                        data: Bytes::copy_from_slice(epb.data),
                    };

                    reader.consume(offset);
                    return Ok(Some(frame));
                }
                PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                    *frame_number += 1;

                    let frame = CapturedFrame {
                        frame_number: *frame_number,
                        timestamp_us: 0,
                        link_type: *link_type,
                        data: Bytes::copy_from_slice(spb.data),
                    };

                    reader.consume(offset);
                    return Ok(Some(frame));
                }
                _ => reader.consume(offset),
            },
            Err(ParserError::Eof) => return Ok(None),
            Err(ParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("PCAPNG refill error: {}", e)))?;
            }
            Err(e) => return Err(invalid(format!("PCAPNG parse error: {}", e))),
        }
    }
}

fn invalid(reason: String) -> Error {
    Error::Pcap(PcapError::InvalidFormat { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_utils::{build_tcp_frame, pcap_file};
    use crate::packet::TCP_FLAG_SYN;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn syn_frame() -> Vec<u8> {
        build_tcp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 80, 5, 0, TCP_FLAG_SYN, &[])
    }

    // Test 1: Magic detection
    #[test]
    fn test_format_detection() {
        assert_eq!(
            PcapFormat::detect(&[0xd4, 0xc3, 0xb2, 0xa1]).unwrap(),
            PcapFormat::LegacyMicro
        );
        assert_eq!(
            PcapFormat::detect(&[0xa1, 0xb2, 0xc3, 0xd4]).unwrap(),
            PcapFormat::LegacyMicro
        );
        assert_eq!(
            PcapFormat::detect(&[0x4d, 0x3c, 0xb2, 0xa1]).unwrap(),
            PcapFormat::LegacyNano
        );
        assert_eq!(
            PcapFormat::detect(&[0x0a, 0x0d, 0x0d, 0x0a]).unwrap(),
            PcapFormat::PcapNg
        );
        assert!(PcapFormat::detect(&[0, 1, 2, 3]).is_err());
        assert!(PcapFormat::detect(&[0xd4]).is_err());
    }

    // Test 2: Read frames with timestamps
    #[test]
    fn test_read_legacy_frames() {
        let frame = syn_frame();
        let data = pcap_file(&[(1_000_000_250, frame.clone()), (1_000_001_500, frame.clone())]);

        let mut reader = PcapReader::new(Cursor::new(data)).unwrap();
        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(first.frame_number, 1);
        assert_eq!(first.timestamp_us, 1_000_000_250);
        assert_eq!(first.link_type, LINKTYPE_ETHERNET);
        assert_eq!(first.data.as_ref(), frame.as_slice());

        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(second.timestamp_us, 1_000_001_500);
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.frame_count(), 2);
    }

    // Test 3: Open from disk and iterate
    #[test]
    fn test_open_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&pcap_file(&[(0, syn_frame())])).unwrap();
        file.flush().unwrap();

        let reader = PcapReader::open(file.path()).unwrap();
        assert_eq!(reader.format(), PcapFormat::LegacyMicro);
        let frames: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(frames.len(), 1);
    }

    // Test 4: Missing and garbage files
    #[test]
    fn test_open_errors() {
        assert!(matches!(
            PcapReader::open("/nonexistent/capture.pcap"),
            Err(Error::Pcap(PcapError::FileNotFound { .. }))
        ));
        assert!(PcapReader::new(Cursor::new(b"not a pcap file".to_vec())).is_err());
        assert!(PcapReader::new(Cursor::new(vec![0xd4, 0xc3])).is_err());
    }
}
