use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const BIND_TOKEN_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const BIND_TOKEN_LEN: usize = 12;

/// Random one-time bind code. Ambiguous characters are left out so it can be
/// typed on a device.
pub fn generate_bind_token() -> String {
    let mut rng = rand::rng();
    (0..BIND_TOKEN_LEN)
        .map(|_| {
            let idx = rng.random_range(0..BIND_TOKEN_CHARSET.len());
            BIND_TOKEN_CHARSET[idx] as char
        })
        .collect()
}

/// SHA-256 hex digest stored in place of a bind token.
pub fn hash_bind_token(token: &str) -> String {
    let normalized = token.trim().to_ascii_uppercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Constant-time equality for secrets of possibly different length.
pub fn secrets_match(expected: &str, candidate: &str) -> bool {
    expected.len() == candidate.len() && expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}
