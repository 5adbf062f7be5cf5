//! Content hashing helpers.
//!
//! Page identifiers embed a digest of the module path so that files
//! with identical stems in different directories stay distinct.

/// Hex length used for identifier suffixes (128 bits).
const IDENT_DIGEST_LEN: usize = 32;

/// Hash arbitrary bytes to a full lowercase hex digest.
pub fn hex_digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Stable short digest for identifier suffixes.
pub fn ident_digest(text: &str) -> String {
    let mut digest = hex_digest(text.as_bytes());
    digest.truncate(IDENT_DIGEST_LEN);
    digest
}
