//! Webhook signature verification
//!
//! WeChat signs every callback with
//! `signature = hex(SHA1(concat(sort([token, timestamp, nonce]))))`.

use sha1::{Digest, Sha1};

/// Compute the signature for a token, timestamp and nonce
pub fn sign(token: &str, timestamp: &str, nonce: &str) -> String {
    let mut parts = [token, timestamp, nonce];
    parts.sort_unstable();

    let combined = parts.concat();
    let hash = Sha1::digest(combined.as_bytes());
    hex::encode(hash)
}

/// Verify a signature sent by WeChat
pub fn verify(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
    sign(token, timestamp, nonce) == signature
}
