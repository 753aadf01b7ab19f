//! Project identifiers: 9 random bytes rendered as 12 URL-safe base64 characters.

use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;

/// Number of random bytes behind each identifier.
pub const IDENTIFIER_BYTES: usize = 9;

/// Length of the encoded identifier (9 bytes -> 12 characters, no padding).
pub const IDENTIFIER_LEN: usize = 12;

/// Generate a fresh identifier from the thread-local CSPRNG.
pub fn generate() -> String {
    let mut raw = [0u8; IDENTIFIER_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// Return true if `candidate` could have been produced by [`generate`].
pub fn is_well_formed(candidate: &str) -> bool {
    candidate.len() == IDENTIFIER_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
