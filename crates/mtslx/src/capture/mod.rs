//! Packet sources: stored capture files and live interfaces.

pub mod file;
#[cfg(feature = "live")]
pub mod live;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Options for opening a live capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveOptions {
    pub interface: String,
    pub snaplen: i32,
    pub promisc: bool,
    /// `None` blocks until a frame or a stop request arrives
    pub read_timeout: Option<Duration>,
    pub bpf_filter: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open capture source '{source_name}': {reason}")]
    Open { source_name: String, reason: String },
    #[error("permission denied opening '{0}' (run as root or grant CAP_NET_RAW)")]
    Permission(String),
    #[error("malformed capture file '{path}': {reason}")]
    Format { path: String, reason: String },
    #[error("capture read error: {0}")]
    Read(String),
    #[error("invalid capture filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },
}

/// Link-layer framing of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4/IPv6 packet
    RawIp,
    /// Linux cooked capture (`any` device)
    LinuxSll,
    /// BSD loopback: 4-byte address family then IP
    Null,
    Unsupported(i32),
}

impl LinkType {
    /// Map a pcap DLT / LINKTYPE number.
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            0 | 108 => Self::Null,
            1 => Self::Ethernet,
            12 | 14 | 101 | 228 | 229 => Self::RawIp,
            113 => Self::LinuxSll,
            other => Self::Unsupported(other),
        }
    }
}

/// A captured link-layer frame.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub timestamp: DateTime<Utc>,
    pub link_type: LinkType,
    pub data: Vec<u8>,
    /// Bytes captured (after snap length truncation)
    pub caplen: u32,
    /// Length of the frame on the wire
    pub orig_len: u32,
}

/// Sequential, time-ordered feed of frames.
pub trait FrameSource {
    /// `Ok(None)` marks the end of the feed: end of file, or a stop request
    /// for live capture.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError>;
}

/// Build a UTC timestamp from seconds and a sub-second part at `resolution`
/// units per second. Out-of-range values clamp to the epoch.
pub(crate) fn timestamp(secs: i64, frac: u64, resolution: u64) -> DateTime<Utc> {
    let nanos = if resolution == 0 {
        0
    } else {
        (frac as u128 * 1_000_000_000 / resolution as u128) as u64
    };
    let secs = secs + (nanos / 1_000_000_000) as i64;
    let nanos = (nanos % 1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default()
}
