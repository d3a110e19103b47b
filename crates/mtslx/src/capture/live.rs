use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pcap::{Active, Capture, Device};
use tracing::{debug, warn};

use super::{timestamp, FrameSource, LinkType, LiveOptions, RawFrame, SourceError};

/// Poll interval used when the configured timeout is "block forever", so the
/// stop flag is still checked regularly.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Consecutive read failures tolerated before the capture is abandoned.
const MAX_READ_ERRORS: u32 = 8;

/// Frames captured from a network interface.
pub struct LiveSource {
    cap: Capture<Active>,
    link_type: LinkType,
    stop: Arc<AtomicBool>,
    blocking: bool,
    read_errors: u32,
}

impl LiveSource {
    pub fn open(opts: &LiveOptions, stop: Arc<AtomicBool>) -> Result<Self, SourceError> {
        let timeout = opts.read_timeout.unwrap_or(POLL_INTERVAL);
        let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;

        let mut cap = Capture::from_device(opts.interface.as_str())
            .map_err(|e| open_error(&opts.interface, e))?
            .promisc(opts.promisc)
            .snaplen(opts.snaplen)
            .timeout(timeout_ms)
            .open()
            .map_err(|e| open_error(&opts.interface, e))?;

        if !opts.bpf_filter.is_empty() {
            cap.filter(&opts.bpf_filter, true)
                .map_err(|e| SourceError::Filter {
                    filter: opts.bpf_filter.clone(),
                    reason: e.to_string(),
                })?;
        }

        let link_type = LinkType::from_dlt(cap.get_datalink().0);
        debug!(
            "Capture active on {} ({:?}), filter '{}', timeout {}ms",
            opts.interface, link_type, opts.bpf_filter, timeout_ms
        );

        Ok(Self {
            cap,
            link_type,
            stop,
            blocking: opts.read_timeout.is_none(),
            read_errors: 0,
        })
    }
}

impl FrameSource for LiveSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
            match self.cap.next_packet() {
                Ok(packet) => {
                    self.read_errors = 0;
                    let ts = timestamp(
                        packet.header.ts.tv_sec as i64,
                        packet.header.ts.tv_usec as u64,
                        1_000_000,
                    );
                    return Ok(Some(RawFrame {
                        timestamp: ts,
                        link_type: self.link_type,
                        data: packet.data.to_vec(),
                        caplen: packet.header.caplen,
                        orig_len: packet.header.len,
                    }));
                }
                Err(pcap::Error::TimeoutExpired) => {
                    if !self.blocking {
                        debug!("Read timeout expired with no packets");
                    }
                }
                Err(pcap::Error::NoMorePackets) => return Ok(None),
                Err(e) => {
                    self.read_errors += 1;
                    if self.read_errors >= MAX_READ_ERRORS {
                        return Err(SourceError::Read(e.to_string()));
                    }
                    warn!("Capture read error ({}/{}): {}", self.read_errors, MAX_READ_ERRORS, e);
                }
            }
        }
    }
}

fn open_error(interface: &str, err: pcap::Error) -> SourceError {
    let reason = err.to_string();
    let lower = reason.to_lowercase();
    if lower.contains("permission") || lower.contains("not permitted") {
        SourceError::Permission(interface.to_string())
    } else {
        SourceError::Open {
            source_name: interface.to_string(),
            reason,
        }
    }
}

/// List all available network interfaces.
pub fn list_interfaces() -> Result<(), SourceError> {
    let devices = Device::list().map_err(|e| open_error("(device list)", e))?;

    if devices.is_empty() {
        println!("No network interfaces found.");
        println!("Hint: run with sudo or set CAP_NET_RAW capability.");
        return Ok(());
    }

    println!("Available interfaces:");
    for dev in &devices {
        let desc = dev.desc.as_deref().unwrap_or("");
        let addrs: Vec<String> = dev.addresses.iter().map(|a| a.addr.to_string()).collect();
        let addr_str = if addrs.is_empty() {
            "(no addresses)".to_string()
        } else {
            addrs.join(", ")
        };
        println!("  {:<16} {} [{}]", dev.name, desc, addr_str);
    }

    println!("\nUsage: mtslx --iface <interface>");
    Ok(())
}
