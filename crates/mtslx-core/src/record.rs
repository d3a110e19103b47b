use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};

use crate::fingerprint::ja3;
use crate::fingerprint::types::HandshakeMessage;

/// Which side of the handshake a fingerprint describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// JA3, from a ClientHello
    Client,
    /// JA3S, from a ServerHello
    Server,
}

impl Role {
    /// Name of the fingerprint family for this role.
    pub fn label(self) -> &'static str {
        match self {
            Self::Client => "ja3",
            Self::Server => "ja3s",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One emitted fingerprint. The source is always the sender of the hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord {
    pub timestamp: DateTime<Utc>,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub role: Role,
    /// JA3 or JA3S string before hashing
    pub raw: String,
    /// MD5 of `raw`, lower-case hex
    pub digest: String,
}

impl FingerprintRecord {
    /// Fingerprint `message`, sent from `source` to `destination` at `timestamp`.
    pub fn from_message(
        message: &HandshakeMessage,
        source: SocketAddr,
        destination: SocketAddr,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let result = ja3::fingerprint(message);
        let role = if message.is_client_hello() {
            Role::Client
        } else {
            Role::Server
        };
        Self {
            timestamp,
            source_ip: source.ip(),
            source_port: source.port(),
            destination_ip: destination.ip(),
            destination_port: destination.port(),
            role,
            raw: result.raw_string,
            digest: result.hash,
        }
    }
}
