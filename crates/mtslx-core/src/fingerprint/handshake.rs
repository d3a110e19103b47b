use tls_parser::{parse_tls_message_handshake, TlsMessage, TlsMessageHandshake};

use crate::fingerprint::types::{ClientHelloInfo, HandshakeMessage, ServerHelloInfo};

pub const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

/// Largest record fragment a peer may send (2^14 plus compression expansion).
pub const MAX_RECORD_LEN: usize = 16384 + 2048;
/// Hello messages are small; anything above this is not worth buffering.
pub const MAX_HANDSHAKE_LEN: usize = 64 * 1024;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("incomplete TLS data: need {needed} more bytes")]
    Incomplete { needed: usize },
    #[error("not a TLS handshake record (content type 0x{0:02x})")]
    NotHandshake(u8),
    #[error("unsupported record version 0x{0:04x}")]
    UnsupportedVersion(u16),
    #[error("handshake message type {0} is not a ClientHello or ServerHello")]
    UnexpectedMessage(u8),
    #[error("{what} length {len} exceeds limit of {max} bytes")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
    #[error("malformed handshake: {0}")]
    Malformed(String),
}

impl ParseError {
    /// True when more stream bytes could still turn this into a success.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

/// A hello message and the number of stream bytes its records occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub message: HandshakeMessage,
    pub consumed: usize,
}

/// Decode the first handshake message from a reassembled TCP byte stream.
///
/// `stream` must start on a TLS record boundary. A message split across
/// several handshake records is joined before decoding. `consumed` covers
/// every record the message was read from, including any further handshake
/// messages packed into the last of those records.
pub fn parse_handshake(stream: &[u8]) -> Result<Decoded, ParseError> {
    let mut pos = 0;
    let mut record_version = None;
    let mut message = Vec::new();

    let total = loop {
        let (version, fragment) = read_record(&stream[pos..])?;
        record_version.get_or_insert(version);
        message.extend_from_slice(fragment);
        pos += RECORD_HEADER_LEN + fragment.len();

        if message.len() >= HANDSHAKE_HEADER_LEN {
            let body_len = u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize;
            if body_len > MAX_HANDSHAKE_LEN {
                return Err(ParseError::TooLarge {
                    what: "handshake message",
                    len: body_len,
                    max: MAX_HANDSHAKE_LEN,
                });
            }
            let total = HANDSHAKE_HEADER_LEN + body_len;
            if message.len() >= total {
                break total;
            }
        }
    };

    let record_version = record_version.unwrap_or_default();
    let message = decode_hello(&message[..total], record_version)?;

    Ok(Decoded {
        message,
        consumed: pos,
    })
}

/// Split one handshake record off the front of `data`.
fn read_record(data: &[u8]) -> Result<(u16, &[u8]), ParseError> {
    if data.len() < RECORD_HEADER_LEN {
        if let Some(&content_type) = data.first() {
            if content_type != CONTENT_TYPE_HANDSHAKE {
                return Err(ParseError::NotHandshake(content_type));
            }
        }
        return Err(ParseError::Incomplete {
            needed: RECORD_HEADER_LEN - data.len(),
        });
    }

    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(ParseError::NotHandshake(data[0]));
    }

    let version = u16::from_be_bytes([data[1], data[2]]);
    if data[1] != 0x03 {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if len == 0 {
        return Err(ParseError::Malformed("empty handshake record".into()));
    }
    if len > MAX_RECORD_LEN {
        return Err(ParseError::TooLarge {
            what: "record",
            len,
            max: MAX_RECORD_LEN,
        });
    }

    let end = RECORD_HEADER_LEN + len;
    if data.len() < end {
        return Err(ParseError::Incomplete {
            needed: end - data.len(),
        });
    }

    Ok((version, &data[RECORD_HEADER_LEN..end]))
}

fn decode_hello(message: &[u8], record_version: u16) -> Result<HandshakeMessage, ParseError> {
    let msg_type = message[0];
    if msg_type != HANDSHAKE_CLIENT_HELLO && msg_type != HANDSHAKE_SERVER_HELLO {
        return Err(ParseError::UnexpectedMessage(msg_type));
    }

    let (_, parsed) = parse_tls_message_handshake(message)
        .map_err(|e| ParseError::Malformed(format!("{}", e)))?;

    match parsed {
        TlsMessage::Handshake(TlsMessageHandshake::ClientHello(ch)) => {
            let ext = Extensions::decode(ch.ext.unwrap_or_default())?;
            Ok(HandshakeMessage::ClientHello(ClientHelloInfo {
                record_version,
                tls_version: ch.version.0,
                cipher_suites: ch.ciphers.iter().map(|c| c.0).collect(),
                extensions: ext.types,
                elliptic_curves: ext.curves,
                ec_point_formats: ext.point_formats,
                server_name: ext.server_name,
            }))
        }
        TlsMessage::Handshake(TlsMessageHandshake::ServerHello(sh)) => {
            let ext = Extensions::decode(sh.ext.unwrap_or_default())?;
            Ok(HandshakeMessage::ServerHello(ServerHelloInfo {
                record_version,
                tls_version: sh.version.0,
                cipher_suite: sh.cipher.0,
                extensions: ext.types,
                elliptic_curves: ext.curves,
                ec_point_formats: ext.point_formats,
            }))
        }
        // Draft TLS 1.3 server hellos and anything else tls-parser maps differently.
        _ => Err(ParseError::UnexpectedMessage(msg_type)),
    }
}

/// Extension fields relevant to fingerprinting.
#[derive(Debug, Default)]
struct Extensions {
    types: Vec<u16>,
    curves: Vec<u16>,
    point_formats: Vec<u8>,
    server_name: Option<String>,
}

impl Extensions {
    /// Walk a raw extension block as `(type: u16, length: u16, data)` entries.
    fn decode(mut block: &[u8]) -> Result<Self, ParseError> {
        let mut ext = Self::default();

        while !block.is_empty() {
            let mut r = Reader::new(block);
            let ext_type = r.u16("extension type")?;
            let data = r.vec16("extension data")?;
            block = r.rest();

            ext.types.push(ext_type);
            match ext_type {
                EXT_SUPPORTED_GROUPS => ext.curves = decode_u16_list(data, "supported_groups")?,
                EXT_EC_POINT_FORMATS => {
                    ext.point_formats = Reader::new(data).vec8("ec_point_formats")?.to_vec();
                }
                EXT_SERVER_NAME if !data.is_empty() => ext.server_name = decode_server_name(data)?,
                _ => {}
            }
        }

        Ok(ext)
    }
}

fn decode_u16_list(data: &[u8], what: &'static str) -> Result<Vec<u16>, ParseError> {
    let list = Reader::new(data).vec16(what)?;
    if list.len() % 2 != 0 {
        return Err(ParseError::Malformed(format!("{} has odd length {}", what, list.len())));
    }
    Ok(list
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// First host_name entry of a server_name extension.
fn decode_server_name(data: &[u8]) -> Result<Option<String>, ParseError> {
    let mut list = Reader::new(Reader::new(data).vec16("server_name list")?);
    while !list.is_empty() {
        let name_type = list.u8("server_name type")?;
        let name = list.vec16("server_name")?;
        if name_type == 0 {
            return Ok(std::str::from_utf8(name).ok().map(str::to_string));
        }
    }
    Ok(None)
}

/// Big-endian cursor with length-checked reads.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        if self.buf.len() < n {
            return Err(ParseError::Malformed(format!(
                "{} truncated: need {} bytes, have {}",
                what,
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ParseError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self, what: &'static str) -> Result<&'a [u8], ParseError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn vec16(&mut self, what: &'static str) -> Result<&'a [u8], ParseError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }
}

/// Builders for hello messages used by tests across the workspace.
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing {
    /// Assemble a ClientHello handshake message (without record header).
    pub fn client_hello_message(version: u16, ciphers: &[u16], extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0x11; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
        for c in ciphers {
            body.extend_from_slice(&c.to_be_bytes());
        }
        body.extend_from_slice(&[1, 0]); // null compression
        append_extensions(&mut body, extensions);
        handshake(0x01, &body)
    }

    /// Assemble a ServerHello handshake message (without record header).
    pub fn server_hello_message(version: u16, cipher: u16, extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0x22; 32]);
        body.push(0);
        body.extend_from_slice(&cipher.to_be_bytes());
        body.push(0);
        append_extensions(&mut body, extensions);
        handshake(0x02, &body)
    }

    /// Wrap `payload` in a single handshake record.
    pub fn record(version: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x16];
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn supported_groups(groups: &[u16]) -> (u16, Vec<u8>) {
        let mut data = ((groups.len() * 2) as u16).to_be_bytes().to_vec();
        for g in groups {
            data.extend_from_slice(&g.to_be_bytes());
        }
        (0x000a, data)
    }

    pub fn ec_point_formats(formats: &[u8]) -> (u16, Vec<u8>) {
        let mut data = vec![formats.len() as u8];
        data.extend_from_slice(formats);
        (0x000b, data)
    }

    pub fn server_name(host: &str) -> (u16, Vec<u8>) {
        let mut entry = vec![0u8];
        entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        entry.extend_from_slice(host.as_bytes());
        let mut data = (entry.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&entry);
        (0x0000, data)
    }

    fn append_extensions(body: &mut Vec<u8>, extensions: &[(u16, Vec<u8>)]) {
        if extensions.is_empty() {
            return;
        }
        let mut block = Vec::new();
        for (ty, data) in extensions {
            block.extend_from_slice(&ty.to_be_bytes());
            block.extend_from_slice(&(data.len() as u16).to_be_bytes());
            block.extend_from_slice(data);
        }
        body.extend_from_slice(&(block.len() as u16).to_be_bytes());
        body.extend_from_slice(&block);
    }

    fn handshake(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len() as u32;
        let mut out = vec![msg_type];
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }
}
