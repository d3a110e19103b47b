pub mod grease;
pub mod handshake;
pub mod ja3;
pub mod types;
