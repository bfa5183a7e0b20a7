//! SHA-256 utilities
//!
//! - Content-derived event IDs
//! - Digest rendering for logs

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hex-encoded SHA-256, the form event IDs take on the wire.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}
