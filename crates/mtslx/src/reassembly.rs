use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::packet::Segment;

/// Identifies a bidirectional TCP flow: both endpoints in canonical order,
/// so a packet and its reply map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    lo: SocketAddr,
    hi: SocketAddr,
}

impl FlowKey {
    pub fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.lo, self.hi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
    /// Buffer cap exceeded; the flow is ignored until it closes or idles out.
    Expired,
}

#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// How far ahead of the next expected sequence number a segment may
    /// start and still be held for resequencing.
    pub reorder_window: u32,
    /// Cap on assembled plus held bytes per session.
    pub max_session_bytes: usize,
    /// Sessions idle for longer than this are evicted.
    pub idle_timeout: Duration,
    /// Cap on tracked sessions; the least recently seen is evicted.
    pub max_sessions: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            reorder_window: 32 * 1024,
            max_session_bytes: 64 * 1024,
            idle_timeout: Duration::from_secs(30),
            max_sessions: 65536,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_evicted: u64,
    pub sessions_expired: u64,
    pub out_of_window_segments: u64,
}

/// Outcome of offering a segment to a half-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// New contiguous bytes were assembled.
    Appended,
    /// Segment is ahead of a gap and waits for it to fill.
    Held,
    /// Every byte was already assembled.
    Duplicate,
    /// Segment starts beyond the reorder window and was dropped.
    OutOfWindow,
    /// The stream no longer buffers, or the segment carried nothing.
    Ignored,
}

/// One direction of a TCP connection.
#[derive(Debug, Default)]
pub struct HalfStream {
    /// Sequence number of the byte following `buf`
    next_seq: Option<u32>,
    /// Start of stream known from a SYN
    anchored: bool,
    /// Assembled bytes not yet consumed by the parser
    buf: Vec<u8>,
    /// Bytes already consumed and discarded
    consumed: u64,
    /// Out-of-order segments waiting for a gap to fill
    held: Vec<(u32, Vec<u8>)>,
    held_bytes: usize,
    /// Handshake decoded or abandoned; nothing more is buffered
    finished: bool,
    fin: bool,
}

impl HalfStream {
    /// Contiguous bytes available to the parser.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len() + self.held_bytes
    }

    #[cfg(test)]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Discard the first `n` assembled bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.consumed += n as u64;
    }

    /// Stop buffering this direction and release its memory.
    pub fn finish(&mut self) {
        self.finished = true;
        self.clear();
    }

    fn clear(&mut self) {
        self.buf = Vec::new();
        self.held = Vec::new();
        self.held_bytes = 0;
    }

    /// An earlier segment may still arrive and move the stream start back:
    /// no SYN seen, nothing consumed, and less than a reorder window
    /// assembled.
    pub fn may_rewind(&self, window: u32) -> bool {
        !self.anchored && self.consumed == 0 && self.buf.len() < window as usize
    }

    fn on_syn(&mut self, seq: u32) {
        if self.anchored || self.finished || self.consumed > 0 {
            return;
        }
        self.rebase(seq.wrapping_add(1));
        self.anchored = true;
    }

    /// Offer `payload` starting at sequence number `seq`.
    pub fn push(&mut self, seq: u32, payload: &[u8], window: u32) -> Push {
        if self.finished || payload.is_empty() {
            return Push::Ignored;
        }

        let Some(next) = self.next_seq else {
            self.next_seq = Some(seq);
            self.append(payload);
            return Push::Appended;
        };

        let offset = seq.wrapping_sub(next) as i32;
        if offset < 0 {
            let behind = offset.unsigned_abs() as usize;
            let start = next.wrapping_sub(self.buf.len() as u32);
            let before_start = (start.wrapping_sub(seq) as i32) > 0;
            if before_start && self.may_rewind(window) && behind <= window as usize {
                // The stream start is not known yet and a segment from before
                // everything assembled so far showed up late: restart from it.
                self.rebase(seq);
                self.append(payload);
                self.drain_held();
                return Push::Appended;
            }
            if behind >= payload.len() {
                return Push::Duplicate;
            }
            self.append(&payload[behind..]);
            self.drain_held();
            return Push::Appended;
        }

        if offset == 0 {
            self.append(payload);
            self.drain_held();
            return Push::Appended;
        }

        if offset as u32 > window {
            return Push::OutOfWindow;
        }

        if self
            .held
            .iter()
            .any(|(s, data)| *s == seq && data.len() >= payload.len())
        {
            return Push::Duplicate;
        }
        self.held_bytes += payload.len();
        self.held.push((seq, payload.to_vec()));
        Push::Held
    }

    fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if let Some(next) = self.next_seq.as_mut() {
            *next = next.wrapping_add(data.len() as u32);
        }
    }

    /// Move assembled bytes back into the holding area and restart at `seq`.
    fn rebase(&mut self, seq: u32) {
        if let Some(next) = self.next_seq {
            if !self.buf.is_empty() {
                let start = next.wrapping_sub(self.buf.len() as u32);
                let data = std::mem::take(&mut self.buf);
                self.held_bytes += data.len();
                self.held.push((start, data));
            }
        }
        self.next_seq = Some(seq);
        self.drain_held();
    }

    /// Splice in every held segment that now touches the assembled stream.
    fn drain_held(&mut self) {
        while let Some(next) = self.next_seq {
            let Some(idx) = self
                .held
                .iter()
                .position(|(s, _)| (s.wrapping_sub(next) as i32) <= 0)
            else {
                return;
            };
            let (start, data) = self.held.swap_remove(idx);
            self.held_bytes -= data.len();
            let behind = next.wrapping_sub(start) as usize;
            if behind < data.len() {
                self.append(&data[behind..]);
            }
        }
    }
}

/// Per-flow state: endpoints, both directional streams and lifecycle.
#[derive(Debug)]
pub struct FlowSession {
    pub client: SocketAddr,
    pub server: SocketAddr,
    /// Client side confirmed by a SYN or a ClientHello
    roles_known: bool,
    to_server: HalfStream,
    to_client: HalfStream,
    pub state: SessionState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl FlowSession {
    fn new(seg: &Segment, ts: DateTime<Utc>) -> Self {
        // A SYN-ACK comes from the server; otherwise assume the sender is the
        // client until something says otherwise.
        let (client, server) = if seg.syn && seg.ack {
            (seg.dst, seg.src)
        } else {
            (seg.src, seg.dst)
        };
        Self {
            client,
            server,
            roles_known: seg.syn,
            to_server: HalfStream::default(),
            to_client: HalfStream::default(),
            state: SessionState::Open,
            first_seen: ts,
            last_seen: ts,
        }
    }

    pub fn direction_of(&self, sender: SocketAddr) -> Direction {
        if sender == self.client {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    #[cfg(test)]
    pub fn stream(&self, dir: Direction) -> &HalfStream {
        match dir {
            Direction::ToServer => &self.to_server,
            Direction::ToClient => &self.to_client,
        }
    }

    pub fn stream_mut(&mut self, dir: Direction) -> &mut HalfStream {
        match dir {
            Direction::ToServer => &mut self.to_server,
            Direction::ToClient => &mut self.to_client,
        }
    }

    /// Record `client` as the client side unless roles are already settled.
    pub fn assign_client(&mut self, client: SocketAddr) {
        if self.roles_known {
            return;
        }
        self.roles_known = true;
        if client == self.server {
            std::mem::swap(&mut self.client, &mut self.server);
            std::mem::swap(&mut self.to_server, &mut self.to_client);
        }
    }

    pub fn buffered(&self) -> usize {
        self.to_server.buffered() + self.to_client.buffered()
    }

    fn expire(&mut self) {
        self.state = SessionState::Expired;
        self.to_server.finish();
        self.to_client.finish();
    }
}

/// What happened to a segment handed to the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    pub key: FlowKey,
    pub direction: Direction,
    /// The sender's stream gained contiguous bytes worth parsing.
    pub new_data: bool,
    /// RST, or FIN seen from both sides: remove once processed.
    pub closing: bool,
}

/// All tracked flows, owned by a single writer.
pub struct SessionTable {
    sessions: HashMap<FlowKey, FlowSession>,
    config: ReassemblyConfig,
    stats: ReassemblyStats,
}

impl SessionTable {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            config,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn get(&self, key: &FlowKey) -> Option<&FlowSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowSession> {
        self.sessions.get_mut(key)
    }

    /// Route a segment to its session, creating the session if needed.
    ///
    /// Returns `None` when the flow is expired and the segment was dropped.
    pub fn ingest(&mut self, seg: &Segment, ts: DateTime<Utc>) -> Option<Ingested> {
        let key = FlowKey::new(seg.src, seg.dst);

        if !self.sessions.contains_key(&key) {
            if self.sessions.len() >= self.config.max_sessions {
                debug!("Max sessions ({}) reached, evicting oldest", self.config.max_sessions);
                self.evict_oldest();
            }
            self.sessions.insert(key, FlowSession::new(seg, ts));
            self.stats.sessions_created += 1;
        }

        let window = self.config.reorder_window;
        let cap = self.config.max_session_bytes;
        let session = self.sessions.get_mut(&key)?;
        if ts > session.last_seen {
            session.last_seen = ts;
        }

        if session.state == SessionState::Expired {
            if seg.rst || seg.fin {
                self.close(&key);
            }
            return None;
        }

        if seg.syn {
            session.assign_client(if seg.ack { seg.dst } else { seg.src });
        }

        let direction = session.direction_of(seg.src);
        let stream = session.stream_mut(direction);
        let data_seq = if seg.syn {
            stream.on_syn(seg.seq);
            seg.seq.wrapping_add(1)
        } else {
            seg.seq
        };
        let outcome = stream.push(data_seq, seg.payload, window);
        if seg.fin {
            stream.fin = true;
        }

        if outcome == Push::OutOfWindow {
            self.stats.out_of_window_segments += 1;
            debug!("Dropped segment outside reorder window ({} from {})", key, seg.src);
        }

        let closing = seg.rst || (session.to_server.fin && session.to_client.fin);

        if session.buffered() > cap {
            warn!(
                "Session buffer cap exceeded: {} bytes (max {}). Expiring {}",
                session.buffered(),
                cap,
                key
            );
            session.expire();
            self.stats.sessions_expired += 1;
            if closing {
                self.close(&key);
            }
            return None;
        }

        Some(Ingested {
            key,
            direction,
            new_data: outcome == Push::Appended,
            closing,
        })
    }

    /// Mark a session expired: buffers dropped, no further records.
    pub fn expire(&mut self, key: &FlowKey) {
        if let Some(session) = self.sessions.get_mut(key) {
            if session.state != SessionState::Expired {
                session.expire();
                self.stats.sessions_expired += 1;
            }
        }
    }

    /// Remove a session at transport close.
    pub fn close(&mut self, key: &FlowKey) {
        if let Some(mut session) = self.sessions.remove(key) {
            session.state = SessionState::Closed;
            self.stats.sessions_closed += 1;
            let open_for = session.last_seen.signed_duration_since(session.first_seen);
            debug!(
                "Closed session {} after {}ms ({} bytes undecoded)",
                key,
                open_for.num_milliseconds(),
                session.buffered()
            );
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((&oldest_key, _)) = self.sessions.iter().min_by_key(|(_, s)| s.last_seen) {
            debug!("Evicting least recently seen session: {}", oldest_key);
            self.sessions.remove(&oldest_key);
            self.stats.sessions_evicted += 1;
        }
    }

    /// Evict all sessions idle for longer than the idle timeout as of `now`.
    /// Undecoded buffers are discarded. Returns the number of evicted sessions.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let before = self.sessions.len();

        self.sessions.retain(|key, session| {
            let idle = now
                .signed_duration_since(session.last_seen)
                .to_std()
                .map_or(false, |age| age > idle_timeout);
            if idle {
                debug!(
                    "Evicting idle session: {} (buffered {} bytes, state {:?})",
                    key,
                    session.buffered(),
                    session.state
                );
            }
            !idle
        });

        let evicted = before - self.sessions.len();
        self.stats.sessions_evicted += evicted as u64;
        evicted
    }
}
