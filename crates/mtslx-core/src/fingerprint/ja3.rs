use md5::{Digest, Md5};

use crate::fingerprint::grease::strip_grease;
use crate::fingerprint::types::{ClientHelloInfo, HandshakeMessage, Ja3Result, ServerHelloInfo};

/// Compute the JA3 fingerprint from a parsed ClientHello.
///
/// JA3 format: MD5(SSLVersion,Ciphers,Extensions,EllipticCurves,EcPointFormats)
///
/// - Fields separated by commas, values within a field by dashes
/// - GREASE values filtered from ciphers, extensions and curves
/// - All values in decimal; an absent list is an empty field
pub fn compute_ja3(info: &ClientHelloInfo) -> Ja3Result {
    let raw_string = format!(
        "{},{},{},{},{}",
        info.tls_version,
        dash_join(&strip_grease(&info.cipher_suites)),
        dash_join(&strip_grease(&info.extensions)),
        dash_join(&strip_grease(&info.elliptic_curves)),
        dash_join(&info.ec_point_formats),
    );
    digest(raw_string)
}

/// Compute the JA3S fingerprint from a parsed ServerHello.
///
/// JA3S format: MD5(SSLVersion,Cipher,Extensions)
pub fn compute_ja3s(info: &ServerHelloInfo) -> Ja3Result {
    let raw_string = format!(
        "{},{},{}",
        info.tls_version,
        info.cipher_suite,
        dash_join(&strip_grease(&info.extensions)),
    );
    digest(raw_string)
}

/// JA3 for a ClientHello, JA3S for a ServerHello.
pub fn fingerprint(message: &HandshakeMessage) -> Ja3Result {
    match message {
        HandshakeMessage::ClientHello(ch) => compute_ja3(ch),
        HandshakeMessage::ServerHello(sh) => compute_ja3s(sh),
    }
}

fn dash_join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

fn digest(raw_string: String) -> Ja3Result {
    let mut hasher = Md5::new();
    hasher.update(raw_string.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    Ja3Result { hash, raw_string }
}
