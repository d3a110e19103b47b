use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, info};

use mtslx_core::fingerprint::handshake::{parse_handshake, ParseError};
use mtslx_core::record::FingerprintRecord;

use crate::capture::{FrameSource, RawFrame, SourceError};
use crate::output::RecordWriter;
use crate::packet::{self, Segment};
use crate::reassembly::{Ingested, ReassemblyConfig, ReassemblyStats, SessionTable};

/// Frames buffered between the capture thread and the engine.
const FRAME_QUEUE_DEPTH: usize = 4096;
/// How long the engine waits on an empty queue before sweeping idle sessions.
const IDLE_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reassembly: ReassemblyConfig,
    /// Capture-time interval between idle-session sweeps
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reassembly: ReassemblyConfig::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Stop conditions for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    pub max_frames: Option<u64>,
    /// Live capture only
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames: u64,
    pub undecodable_frames: u64,
    pub non_tcp_frames: u64,
    pub client_hellos: u64,
    pub server_hellos: u64,
    /// Streams whose first bytes were not a usable hello
    pub unfingerprintable: u64,
    pub sessions: ReassemblyStats,
}

/// Turns frames into fingerprint records.
pub struct Engine {
    config: EngineConfig,
    sessions: SessionTable,
    stats: EngineStats,
    last_sweep: Option<DateTime<Utc>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let sessions = SessionTable::new(config.reassembly.clone());
        Self {
            config,
            sessions,
            stats: EngineStats::default(),
            last_sweep: None,
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            sessions: self.sessions.stats().clone(),
            ..self.stats.clone()
        }
    }

    /// Sessions currently tracked.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Process one frame. At most one record comes out of a frame, since a
    /// segment only extends one direction of one flow.
    pub fn process_frame(&mut self, frame: &RawFrame) -> Option<FingerprintRecord> {
        self.stats.frames += 1;
        self.maybe_sweep(frame.timestamp);

        let segment = match packet::parse_frame(frame) {
            Ok(Some(segment)) => segment,
            Ok(None) => {
                self.stats.non_tcp_frames += 1;
                return None;
            }
            Err(e) => {
                self.stats.undecodable_frames += 1;
                debug!(
                    "Undecodable frame ({} of {} bytes captured): {}",
                    frame.caplen, frame.orig_len, e
                );
                return None;
            }
        };

        let ingested = self.sessions.ingest(&segment, frame.timestamp)?;
        let record = if ingested.new_data {
            self.try_fingerprint(&ingested, &segment, frame.timestamp)
        } else {
            None
        };

        if ingested.closing {
            self.sessions.close(&ingested.key);
        }
        record
    }

    fn try_fingerprint(
        &mut self,
        ingested: &Ingested,
        seg: &Segment,
        ts: DateTime<Utc>,
    ) -> Option<FingerprintRecord> {
        let cap = self.config.reassembly.max_session_bytes;
        let window = self.config.reassembly.reorder_window;
        let session = self.sessions.get_mut(&ingested.key)?;
        let buffered = session.buffered();
        let stream = session.stream_mut(ingested.direction);
        if stream.is_finished() {
            return None;
        }

        match parse_handshake(stream.pending()) {
            Ok(decoded) => {
                stream.consume(decoded.consumed);
                stream.finish();
                if decoded.message.is_client_hello() {
                    session.assign_client(seg.src);
                    self.stats.client_hellos += 1;
                } else {
                    session.assign_client(seg.dst);
                    self.stats.server_hellos += 1;
                }
                debug!("Handshake from {} on {}", seg.src, ingested.key);
                Some(FingerprintRecord::from_message(&decoded.message, seg.src, seg.dst, ts))
            }
            Err(ParseError::Incomplete { needed }) => {
                if buffered.saturating_add(needed) > cap {
                    debug!(
                        "Handshake on {} needs {} more bytes, over the {} byte cap",
                        ingested.key, needed, cap
                    );
                    self.sessions.expire(&ingested.key);
                }
                None
            }
            Err(e) if stream.may_rewind(window) => {
                // Without a SYN the bytes seen so far may not be the start of
                // the stream yet.
                debug!("Deferring parse on {} from {}: {}", ingested.key, seg.src, e);
                None
            }
            Err(e) => {
                debug!("No fingerprint from {} on {}: {}", seg.src, ingested.key, e);
                stream.finish();
                self.stats.unfingerprintable += 1;
                None
            }
        }
    }

    fn maybe_sweep(&mut self, now: DateTime<Utc>) {
        let Some(last) = self.last_sweep else {
            self.last_sweep = Some(now);
            return;
        };
        let due = now
            .signed_duration_since(last)
            .to_std()
            .map_or(false, |elapsed| elapsed >= self.config.sweep_interval);
        if due {
            self.sweep(now);
        }
    }

    /// Evict sessions idle as of `now`.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        self.last_sweep = Some(now);
        let evicted = self.sessions.evict_idle(now);
        if evicted > 0 {
            debug!("Evicted {} idle sessions, {} active", evicted, self.sessions.len());
        }
        evicted
    }

    /// Log run totals.
    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            "Processed {} frames ({} non-TCP, {} undecodable)",
            stats.frames, stats.non_tcp_frames, stats.undecodable_frames
        );
        info!(
            "Fingerprinted {} ClientHellos and {} ServerHellos ({} streams unfingerprintable)",
            stats.client_hellos, stats.server_hellos, stats.unfingerprintable
        );
        info!(
            "Sessions: {} created, {} closed, {} evicted, {} expired, {} still open; {} segments outside reorder window",
            stats.sessions.sessions_created,
            stats.sessions.sessions_closed,
            stats.sessions.sessions_evicted,
            stats.sessions.sessions_expired,
            self.active_sessions(),
            stats.sessions.out_of_window_segments
        );
    }
}

/// Drain `source` on the current thread. Used for capture files, where the
/// reader never blocks.
pub fn run<S, W>(
    source: &mut S,
    engine: &mut Engine,
    writer: &mut RecordWriter<W>,
    limits: &RunLimits,
    stop: &AtomicBool,
) -> Result<()>
where
    S: FrameSource,
    W: Write,
{
    let mut frames = 0u64;
    while !stop.load(Ordering::Relaxed) {
        if limits.max_frames.is_some_and(|max| frames >= max) {
            debug!("Frame limit reached");
            break;
        }
        let Some(frame) = source.next_frame()? else {
            break;
        };
        frames += 1;
        if let Some(record) = engine.process_frame(&frame) {
            writer.write(&record)?;
        }
    }
    Ok(())
}

/// Capture on a dedicated thread and process frames here, so slow output
/// never stalls the packet reader. The queue is bounded; when it fills the
/// capture thread blocks and the kernel buffer absorbs the burst.
pub fn run_threaded<S, W>(
    source: S,
    engine: &mut Engine,
    writer: &mut RecordWriter<W>,
    limits: &RunLimits,
    stop: Arc<AtomicBool>,
) -> Result<()>
where
    S: FrameSource + Send + 'static,
    W: Write,
{
    let (tx, rx) = bounded::<RawFrame>(FRAME_QUEUE_DEPTH);
    let producer_stop = Arc::clone(&stop);
    let producer = thread::Builder::new()
        .name("capture".into())
        .spawn(move || -> Result<(), SourceError> {
            let mut source = source;
            while !producer_stop.load(Ordering::Relaxed) {
                match source.next_frame()? {
                    Some(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Ok(())
        })?;

    let started = Instant::now();
    let mut frames = 0u64;
    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        if limits.duration.is_some_and(|d| started.elapsed() >= d) {
            info!("Capture duration reached");
            break Ok(());
        }
        match rx.recv_timeout(IDLE_TICK) {
            Ok(frame) => {
                frames += 1;
                if let Some(record) = engine.process_frame(&frame) {
                    if let Err(e) = writer.write(&record) {
                        break Err(anyhow::Error::from(e));
                    }
                }
                if limits.max_frames.is_some_and(|max| frames >= max) {
                    info!("Frame limit reached");
                    break Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                engine.sweep(Utc::now());
            }
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };

    stop.store(true, Ordering::Relaxed);
    drop(rx);
    let produced = producer
        .join()
        .map_err(|_| anyhow!("capture thread panicked"))?;
    result?;
    produced?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use mtslx_core::fingerprint::handshake::testing::{
        client_hello_message, ec_point_formats, record, server_hello_message, server_name,
        supported_groups,
    };
    use mtslx_core::record::Role;

    use crate::capture::file::tests::write_pcap;
    use crate::capture::file::FileSource;
    use crate::output::{OutputFormat, RecordFilter};
    use crate::packet::tests::{raw_frame, tcp_frame, Flags};

    const CLIENT_ISN: u32 = 1_000;
    const SERVER_ISN: u32 = 90_000;

    fn client() -> SocketAddr {
        "192.168.1.100:54321".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "93.184.216.34:443".parse().unwrap()
    }

    fn ack() -> Flags {
        Flags {
            ack: true,
            ..Flags::default()
        }
    }

    fn client_hello() -> Vec<u8> {
        record(
            0x0301,
            &client_hello_message(
                0x0303,
                &[0x0a0a, 0xc02b, 0xc02f],
                &[
                    (0x1a1a, vec![]),
                    server_name("example.com"),
                    supported_groups(&[0x2a2a, 0x001d, 0x0017]),
                    ec_point_formats(&[0]),
                ],
            ),
        )
    }

    fn server_hello() -> Vec<u8> {
        record(0x0303, &server_hello_message(0x0303, 0xc02f, &[(0xff01, vec![0]), (0x000b, vec![1, 0])]))
    }

    /// SYN, SYN-ACK, ClientHello, ServerHello as frames one second apart.
    fn handshake_frames() -> Vec<Vec<u8>> {
        vec![
            tcp_frame(client(), server(), CLIENT_ISN, Flags { syn: true, ..Flags::default() }, &[]),
            tcp_frame(server(), client(), SERVER_ISN, Flags { syn: true, ack: true, ..Flags::default() }, &[]),
            tcp_frame(client(), server(), CLIENT_ISN + 1, ack(), &client_hello()),
            tcp_frame(server(), client(), SERVER_ISN + 1, ack(), &server_hello()),
        ]
    }

    fn run_frames(engine: &mut Engine, frames: Vec<(i64, Vec<u8>)>) -> Vec<FingerprintRecord> {
        frames
            .into_iter()
            .filter_map(|(secs, data)| engine.process_frame(&raw_frame(secs, data)))
            .collect()
    }

    #[test]
    fn full_handshake_yields_ja3_and_ja3s() {
        let mut engine = Engine::new(EngineConfig::default());
        let frames = handshake_frames().into_iter().enumerate().map(|(i, f)| (i as i64, f)).collect();
        let records = run_frames(&mut engine, frames);

        assert_eq!(records.len(), 2);
        let ja3 = &records[0];
        assert_eq!(ja3.role, Role::Client);
        assert_eq!(ja3.raw, "771,49195-49199,0-10-11,29-23,0");
        assert_eq!(ja3.source_port, 54321);
        assert_eq!(ja3.destination_port, 443);
        assert_eq!(ja3.timestamp.timestamp(), 2);

        let ja3s = &records[1];
        assert_eq!(ja3s.role, Role::Server);
        assert_eq!(ja3s.raw, "771,49199,65281-11");
        assert_eq!(ja3s.source_ip, server().ip());

        let stats = engine.stats();
        assert_eq!(stats.client_hellos, 1);
        assert_eq!(stats.server_hellos, 1);
        assert_eq!(stats.sessions.sessions_created, 1);
    }

    #[test]
    fn split_and_reordered_hello() {
        let hello = client_hello();
        let (a, rest) = hello.split_at(7);
        let (b, c) = rest.split_at(20);
        let seq_b = CLIENT_ISN + 1 + a.len() as u32;
        let seq_c = seq_b + b.len() as u32;

        let mut engine = Engine::new(EngineConfig::default());
        let records = run_frames(
            &mut engine,
            vec![
                (0, tcp_frame(client(), server(), CLIENT_ISN, Flags { syn: true, ..Flags::default() }, &[])),
                (1, tcp_frame(client(), server(), seq_c, ack(), c)),
                (1, tcp_frame(client(), server(), seq_b, ack(), b)),
                (2, tcp_frame(client(), server(), CLIENT_ISN + 1, ack(), a)),
            ],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw, "771,49195-49199,0-10-11,29-23,0");
        assert_eq!(records[0].timestamp.timestamp(), 2);
    }

    #[test]
    fn mid_stream_capture_still_fingerprints() {
        // No SYN: capture started after the handshake began.
        let mut engine = Engine::new(EngineConfig::default());
        let records = run_frames(
            &mut engine,
            vec![(0, tcp_frame(server(), client(), 5, ack(), &server_hello()))],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, Role::Server);
        assert_eq!(records[0].source_port, 443);
    }

    #[test]
    fn one_record_per_direction() {
        let mut engine = Engine::new(EngineConfig::default());
        let hello = client_hello();
        let mut frames: Vec<(i64, Vec<u8>)> = handshake_frames().into_iter().map(|f| (0, f)).collect();
        let next = CLIENT_ISN + 1 + hello.len() as u32;
        frames.push((1, tcp_frame(client(), server(), next, ack(), &hello)));
        assert_eq!(run_frames(&mut engine, frames).len(), 2);
    }

    #[test]
    fn truncated_hello_emits_nothing() {
        let hello = client_hello();
        let mut engine = Engine::new(EngineConfig::default());
        let records = run_frames(
            &mut engine,
            vec![
                (0, tcp_frame(client(), server(), CLIENT_ISN, Flags { syn: true, ..Flags::default() }, &[])),
                (1, tcp_frame(client(), server(), CLIENT_ISN + 1, ack(), &hello[..hello.len() / 2])),
                (2, tcp_frame(client(), server(), CLIENT_ISN + 1, Flags { rst: true, ..Flags::default() }, &[])),
            ],
        );
        assert!(records.is_empty());
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn non_tls_stream_is_unfingerprintable() {
        let web: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let mut engine = Engine::new(EngineConfig::default());
        let records = run_frames(
            &mut engine,
            vec![
                (0, tcp_frame(client(), web, 0, Flags { syn: true, ..Flags::default() }, &[])),
                (0, tcp_frame(client(), web, 1, ack(), b"GET / HTTP/1.1\r\n\r\n")),
            ],
        );
        assert!(records.is_empty());
        assert_eq!(engine.stats().unfingerprintable, 1);
    }

    #[test]
    fn mid_stream_non_tls_gives_up_after_a_window() {
        let config = EngineConfig {
            reassembly: ReassemblyConfig {
                reorder_window: 16,
                ..ReassemblyConfig::default()
            },
            ..EngineConfig::default()
        };
        let web: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let mut engine = Engine::new(config);
        run_frames(&mut engine, vec![(0, tcp_frame(client(), web, 1, ack(), b"GET /"))]);
        assert_eq!(engine.stats().unfingerprintable, 0);

        run_frames(&mut engine, vec![(0, tcp_frame(client(), web, 6, ack(), b" HTTP/1.1\r\n\r\n"))]);
        assert_eq!(engine.stats().unfingerprintable, 1);
    }

    #[test]
    fn mid_stream_reordered_hello_is_fingerprinted() {
        let hello = server_hello();
        let (a, b) = hello.split_at(20);
        let base = 7_000u32;

        let mut engine = Engine::new(EngineConfig::default());
        let records = run_frames(
            &mut engine,
            vec![
                (0, tcp_frame(server(), client(), base + 20, ack(), b)),
                (1, tcp_frame(server(), client(), base, ack(), a)),
            ],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw, "771,49199,65281-11");
        assert_eq!(engine.stats().unfingerprintable, 0);
    }

    #[test]
    fn mid_stream_retransmission_keeps_hello_intact() {
        let hello = client_hello();
        let (a, rest) = hello.split_at(20);
        let (b, c) = rest.split_at(20);
        let base = 40_000u32;

        let mut engine = Engine::new(EngineConfig::default());
        let records = run_frames(
            &mut engine,
            vec![
                (0, tcp_frame(client(), server(), base, ack(), a)),
                (0, tcp_frame(client(), server(), base + 20, ack(), b)),
                (1, tcp_frame(client(), server(), base, ack(), a)),
                (1, tcp_frame(client(), server(), base + 40, ack(), c)),
            ],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw, "771,49195-49199,0-10-11,29-23,0");
        assert_eq!(engine.stats().unfingerprintable, 0);
    }

    #[test]
    fn oversized_handshake_expires_session() {
        let config = EngineConfig {
            reassembly: ReassemblyConfig {
                max_session_bytes: 256,
                ..ReassemblyConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config);
        // Record header promising 4000 bytes, far beyond the cap.
        let mut data = vec![0x16, 0x03, 0x01, 0x0f, 0xa0];
        data.extend_from_slice(&[0x01; 100]);
        let records = run_frames(&mut engine, vec![(0, tcp_frame(client(), server(), 1, ack(), &data))]);
        assert!(records.is_empty());
        assert_eq!(engine.stats().sessions.sessions_expired, 1);

        // Even a complete hello after that is ignored.
        let more = tcp_frame(client(), server(), 1 + data.len() as u32, ack(), &client_hello());
        assert!(run_frames(&mut engine, vec![(1, more)]).is_empty());
    }

    #[test]
    fn idle_sessions_swept_on_capture_clock() {
        let config = EngineConfig {
            reassembly: ReassemblyConfig {
                idle_timeout: Duration::from_secs(5),
                ..ReassemblyConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config);
        let partial = &client_hello()[..10];
        run_frames(&mut engine, vec![(0, tcp_frame(client(), server(), 1, ack(), partial))]);
        assert_eq!(engine.active_sessions(), 1);

        let other: SocketAddr = "10.1.1.1:999".parse().unwrap();
        run_frames(&mut engine, vec![(60, tcp_frame(other, server(), 1, ack(), &[]))]);
        assert_eq!(engine.active_sessions(), 1);
        assert_eq!(engine.stats().sessions.sessions_evicted, 1);
    }

    #[test]
    fn undecodable_frames_are_counted() {
        let mut engine = Engine::new(EngineConfig::default());
        assert!(engine.process_frame(&raw_frame(0, vec![0xff; 10])).is_none());
        assert_eq!(engine.stats().undecodable_frames, 1);
    }

    #[test]
    fn file_run_writes_records() {
        let frames: Vec<(u32, u32, Vec<u8>)> = handshake_frames()
            .into_iter()
            .enumerate()
            .map(|(i, f)| (1_700_000_000 + i as u32, 0, f))
            .collect();
        let file = write_pcap(&frames);

        let mut source = FileSource::open(file.path()).unwrap();
        let mut engine = Engine::new(EngineConfig::default());
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::JsonLines, RecordFilter::default());
        run(&mut source, &mut engine, &mut writer, &RunLimits::default(), &AtomicBool::new(false)).unwrap();

        let out = String::from_utf8(writer.finish().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"ja3\""));
        assert!(lines[1].contains("\"ja3s\""));
        assert_eq!(engine.stats().frames, 4);
    }

    #[test]
    fn frame_limit_stops_run() {
        let frames: Vec<(u32, u32, Vec<u8>)> =
            handshake_frames().into_iter().map(|f| (1, 0, f)).collect();
        let file = write_pcap(&frames);

        let mut source = FileSource::open(file.path()).unwrap();
        let mut engine = Engine::new(EngineConfig::default());
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::JsonLines, RecordFilter::default());
        let limits = RunLimits {
            max_frames: Some(3),
            duration: None,
        };
        run(&mut source, &mut engine, &mut writer, &limits, &AtomicBool::new(false)).unwrap();
        assert_eq!(engine.stats().frames, 3);
        assert_eq!(writer.written(), 1);
    }

    struct VecSource(std::vec::IntoIter<RawFrame>);

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
            Ok(self.0.next())
        }
    }

    #[test]
    fn threaded_run_drains_source() {
        let frames: Vec<RawFrame> = handshake_frames()
            .into_iter()
            .enumerate()
            .map(|(i, f)| raw_frame(i as i64, f))
            .collect();
        let mut engine = Engine::new(EngineConfig::default());
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::JsonLines, RecordFilter::default());
        let stop = Arc::new(AtomicBool::new(false));

        run_threaded(
            VecSource(frames.into_iter()),
            &mut engine,
            &mut writer,
            &RunLimits::default(),
            Arc::clone(&stop),
        )
        .unwrap();
        assert_eq!(writer.written(), 2);
        assert!(stop.load(Ordering::Relaxed));
    }
}
