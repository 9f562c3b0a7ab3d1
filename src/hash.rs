use ring::digest::{Context, SHA256};
use ripemd::{Digest, Ripemd160};

/// Hex digest of SHA-256 over the UTF-8 bytes of `text`.
pub fn sha256_hex(text: &str) -> String {
    let mut context = Context::new(&SHA256);
    context.update(text.as_bytes());
    let digest = context.finish();

    hex::encode(digest.as_ref())
}

/// Double SHA-256 in the text regimen used for all chain hashes: the second
/// round hashes the hex digest of the first.
pub fn double_sha256(text: &str) -> String {
    sha256_hex(&sha256_hex(text))
}

/// SHA-256 followed by RIPEMD-160, both over hex digests. Used for addresses
/// and public-key fingerprints.
pub fn hash160(text: &str) -> String {
    let sha_digest = sha256_hex(text);

    let mut hasher = Ripemd160::new();
    hasher.update(sha_digest.as_bytes());

    hex::encode(hasher.finalize())
}

/// First 8 hex digits of the double SHA-256 of a wire payload. Receivers do
/// not enforce it.
pub fn payload_checksum(payload: &str) -> String {
    double_sha256(payload)[..8].to_owned()
}
