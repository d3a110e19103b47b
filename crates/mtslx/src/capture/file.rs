use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{create_reader, Block, PcapBlockOwned, PcapError};
use tracing::{debug, warn};

use super::{timestamp, FrameSource, LinkType, RawFrame, SourceError};

const READ_BUFFER: usize = 1 << 20;

/// Frames from a pcap or pcapng file.
pub struct FileSource {
    path: PathBuf,
    reader: Box<dyn PcapReaderIterator>,
    blocks: BlockState,
    done: bool,
}

#[derive(Default)]
struct BlockState {
    header_seen: bool,
    /// Link type and timestamp resolution of a classic pcap file
    legacy: Option<(LinkType, u64)>,
    /// pcapng interfaces of the current section, by interface id
    interfaces: Vec<(LinkType, u64)>,
    last_timestamp: DateTime<Utc>,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|e| SourceError::Open {
            source_name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let reader = create_reader(READ_BUFFER, file).map_err(|e| SourceError::Format {
            path: path.display().to_string(),
            reason: format!("{:?}", e),
        })?;
        debug!("Opened capture file {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            blocks: BlockState::default(),
            done: false,
        })
    }

    /// Header errors are fatal; anything after the header ends the stream.
    fn read_failure(&mut self, reason: String) -> Result<Option<RawFrame>, SourceError> {
        self.done = true;
        if !self.blocks.header_seen {
            return Err(SourceError::Format {
                path: self.path.display().to_string(),
                reason,
            });
        }
        warn!("Stopped reading {}: {}", self.path.display(), reason);
        Ok(None)
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let mut refilled = false;
        while !self.done {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let frame = self.blocks.handle(block);
                    self.reader.consume(offset);
                    refilled = false;
                    if frame.is_some() {
                        return Ok(frame);
                    }
                }
                Err(PcapError::Eof) => {
                    self.done = true;
                }
                Err(PcapError::Incomplete(_)) => {
                    if refilled {
                        return self.read_failure("truncated block at end of file".into());
                    }
                    if let Err(e) = self.reader.refill() {
                        let reason = format!("{:?}", e);
                        return self.read_failure(reason);
                    }
                    refilled = true;
                }
                Err(e) => {
                    let reason = format!("{:?}", e);
                    return self.read_failure(reason);
                }
            }
        }
        Ok(None)
    }
}

impl BlockState {
    fn handle(&mut self, block: PcapBlockOwned) -> Option<RawFrame> {
        match block {
            PcapBlockOwned::LegacyHeader(hdr) => {
                self.header_seen = true;
                let resolution = match hdr.magic_number {
                    0xa1b2_3c4d | 0x4d3c_b2a1 => 1_000_000_000,
                    _ => 1_000_000,
                };
                self.legacy = Some((LinkType::from_dlt(hdr.network.0), resolution));
                None
            }
            PcapBlockOwned::Legacy(b) => {
                let (link_type, resolution) = self.legacy?;
                let ts = timestamp(b.ts_sec as i64, b.ts_usec as u64, resolution);
                Some(self.frame(ts, link_type, b.data, b.caplen, b.origlen))
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                self.header_seen = true;
                self.interfaces.clear();
                None
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                let resolution = ts_resolution(idb.if_tsresol);
                self.interfaces
                    .push((LinkType::from_dlt(idb.linktype.0), resolution));
                None
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let Some(&(link_type, resolution)) = self.interfaces.get(epb.if_id as usize) else {
                    debug!("Packet for unknown interface {}", epb.if_id);
                    return None;
                };
                let units = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                let ts = timestamp(
                    (units / resolution) as i64,
                    units % resolution,
                    resolution,
                );
                Some(self.frame(ts, link_type, epb.data, epb.caplen, epb.origlen))
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                let &(link_type, _) = self.interfaces.first()?;
                let caplen = spb.data.len() as u32;
                Some(self.frame(self.last_timestamp, link_type, spb.data, caplen, spb.origlen))
            }
            PcapBlockOwned::NG(_) => None,
        }
    }

    fn frame(
        &mut self,
        ts: DateTime<Utc>,
        link_type: LinkType,
        data: &[u8],
        caplen: u32,
        orig_len: u32,
    ) -> RawFrame {
        self.last_timestamp = ts;
        let len = (caplen as usize).min(data.len());
        RawFrame {
            timestamp: ts,
            link_type,
            data: data[..len].to_vec(),
            caplen: len as u32,
            orig_len,
        }
    }
}

/// Units per second for a pcapng `if_tsresol` value.
fn ts_resolution(tsresol: u8) -> u64 {
    let exp = (tsresol & 0x7f) as u32;
    if tsresol & 0x80 == 0 {
        10u64.checked_pow(exp).unwrap_or(1_000_000)
    } else {
        1u64.checked_shl(exp).unwrap_or(1_000_000)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Classic little-endian microsecond pcap with Ethernet framing.
    pub(crate) fn write_pcap(frames: &[(u32, u32, Vec<u8>)]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let mut header = Vec::new();
        header.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&65535u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        file.write_all(&header).unwrap();
        for (secs, usecs, data) in frames {
            file.write_all(&record_header(*secs, *usecs, data.len())).unwrap();
            file.write_all(data).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn record_header(secs: u32, usecs: u32, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&secs.to_le_bytes());
        out.extend_from_slice(&usecs.to_le_bytes());
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out
    }

    fn read_all(source: &mut FileSource) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn reads_frames_in_order() {
        let file = write_pcap(&[
            (1_700_000_000, 500_000, vec![1, 2, 3]),
            (1_700_000_001, 0, vec![4, 5]),
        ]);
        let mut source = FileSource::open(file.path()).unwrap();
        let frames = read_all(&mut source);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, vec![1, 2, 3]);
        assert_eq!(frames[0].link_type, LinkType::Ethernet);
        assert_eq!(frames[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(frames[0].timestamp.timestamp_subsec_micros(), 500_000);
        assert_eq!(frames[1].caplen, 2);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn empty_capture_has_no_frames() {
        let file = write_pcap(&[]);
        let mut source = FileSource::open(file.path()).unwrap();
        assert!(read_all(&mut source).is_empty());
    }

    #[test]
    fn garbage_header_is_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"this is not a capture file at all").unwrap();
        file.flush().unwrap();

        let err = FileSource::open(file.path())
            .and_then(|mut s| s.next_frame().map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, SourceError::Format { .. }), "{err:?}");
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = FileSource::open(Path::new("/nonexistent/capture.pcap")).err().unwrap();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    fn truncated_record_ends_the_stream() {
        let file = write_pcap(&[(1, 0, vec![9; 40])]);
        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes.extend_from_slice(&record_header(2, 0, 100));
        bytes.extend_from_slice(&[7; 10]);
        std::fs::write(file.path(), &bytes).unwrap();

        let mut source = FileSource::open(file.path()).unwrap();
        let frames = read_all(&mut source);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.len(), 40);
    }

    #[test]
    fn tsresol_values() {
        assert_eq!(ts_resolution(6), 1_000_000);
        assert_eq!(ts_resolution(9), 1_000_000_000);
        assert_eq!(ts_resolution(0x80 | 10), 1024);
    }
}
