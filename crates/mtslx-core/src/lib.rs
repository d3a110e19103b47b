//! TLS hello decoding and JA3/JA3S fingerprinting.
//!
//! [`fingerprint::handshake::parse_handshake`] turns a reassembled TCP byte
//! stream into a [`fingerprint::types::HandshakeMessage`];
//! [`fingerprint::ja3::fingerprint`] derives the JA3 or JA3S string and digest;
//! [`record::FingerprintRecord`] ties the result to its flow.

pub mod fingerprint;
pub mod record;
