/// Fields of a ClientHello that feed the JA3 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Version from the enclosing TLS record header
    pub record_version: u16,
    /// `client_version` from the handshake body (e.g. 0x0303 for TLS 1.2)
    pub tls_version: u16,
    /// Cipher suite values in wire order
    pub cipher_suites: Vec<u16>,
    /// Extension type codes in wire order
    pub extensions: Vec<u16>,
    /// Supported groups / named curves (extension 0x000a)
    pub elliptic_curves: Vec<u16>,
    /// EC point format values (extension 0x000b)
    pub ec_point_formats: Vec<u8>,
    /// Server Name Indication host name
    pub server_name: Option<String>,
}

/// Fields of a ServerHello that feed the JA3S fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHelloInfo {
    pub record_version: u16,
    /// `server_version` from the handshake body
    pub tls_version: u16,
    /// The single cipher suite chosen by the server
    pub cipher_suite: u16,
    /// Extension type codes in wire order
    pub extensions: Vec<u16>,
    pub elliptic_curves: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
}

/// A decoded hello message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ClientHello(ClientHelloInfo),
    ServerHello(ServerHelloInfo),
}

impl HandshakeMessage {
    pub fn record_version(&self) -> u16 {
        match self {
            Self::ClientHello(ch) => ch.record_version,
            Self::ServerHello(sh) => sh.record_version,
        }
    }

    pub fn is_client_hello(&self) -> bool {
        matches!(self, Self::ClientHello(_))
    }
}

/// Result of a JA3 or JA3S computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3Result {
    /// 32-character MD5 hex digest
    pub hash: String,
    /// The comma/dash separated string that was hashed
    pub raw_string: String,
}
