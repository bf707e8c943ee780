//! Handshake key machinery (RFC 6455 §4.1 and §4.2.2).

use base64::prelude::*;
use sha1::{Digest, Sha1};

/// GUID appended to the challenge key before hashing, from RFC 6455.
const KEY_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Generates a fresh `Sec-WebSocket-Key` value: 16 random bytes, base64.
pub(crate) fn generate_challenge_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Computes the `Sec-WebSocket-Accept` value for a challenge key.
pub(crate) fn compute_accept_key(challenge_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(challenge_key.as_bytes());
    sha1.update(KEY_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}
