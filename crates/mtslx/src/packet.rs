use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Result};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use crate::capture::{LinkType, RawFrame};

/// TCP segment extracted from a frame. No TLS-level inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
}

/// Parse a captured frame down to its TCP segment.
///
/// Returns:
/// - `Ok(Some(segment))` for any TCP segment, with or without payload
/// - `Ok(None)` for non-TCP traffic (UDP, ARP, ICMP, later IP fragments)
/// - `Err` if the frame cannot be decoded for its link type
pub fn parse_frame(frame: &RawFrame) -> Result<Option<Segment<'_>>> {
    let data = frame.data.as_slice();
    let sliced = match frame.link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data)?,
        LinkType::RawIp => SlicedPacket::from_ip(data)?,
        LinkType::LinuxSll => SlicedPacket::from_linux_sll(data)?,
        LinkType::Null => {
            if data.len() < 4 {
                bail!("Loopback header truncated");
            }
            SlicedPacket::from_ip(&data[4..])?
        }
        LinkType::Unsupported(dlt) => bail!("Unsupported link type {}", dlt),
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let hdr = ipv4.header();
            (
                IpAddr::V4(hdr.source_addr()),
                IpAddr::V4(hdr.destination_addr()),
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let hdr = ipv6.header();
            (
                IpAddr::V6(hdr.source_addr()),
                IpAddr::V6(hdr.destination_addr()),
            )
        }
        _ => return Ok(None),
    };

    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return Ok(None);
    };

    Ok(Some(Segment {
        src: SocketAddr::new(src_ip, tcp.source_port()),
        dst: SocketAddr::new(dst_ip, tcp.destination_port()),
        seq: tcp.sequence_number(),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: tcp.payload(),
    }))
}
