//! API key generation and hashing (C10). Keys are prefixed with `evr_` for
//! identification, shown in full only at creation, and stored hashed.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub const API_KEY_PREFIX: &str = "evr_";
const API_KEY_RANDOM_BYTES: usize = 32;

/// A newly-minted key. `key` is returned to the caller exactly once; callers
/// must persist `key_hash` and discard `key`.
#[derive(Debug)]
pub struct GeneratedApiKey {
    pub key: String,
    pub key_hash: String,
    pub key_prefix: String,
}

pub fn generate_api_key() -> GeneratedApiKey {
    let mut bytes = [0u8; API_KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let random_hex = hex::encode(bytes);
    let key = format!("{API_KEY_PREFIX}{random_hex}");
    let key_hash = hash_api_key(&key);
    let key_prefix = format!("{API_KEY_PREFIX}{}...", &random_hex[..8]);
    GeneratedApiKey { key, key_hash, key_prefix }
}

pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

pub fn is_valid_api_key_format(key: &str) -> bool {
    let Some(body) = key.strip_prefix(API_KEY_PREFIX) else { return false };
    body.len() == API_KEY_RANDOM_BYTES * 2 && body.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_round_trips_through_hash() {
        let generated = generate_api_key();
        assert!(is_valid_api_key_format(&generated.key));
        assert_eq!(generated.key_hash, hash_api_key(&generated.key));
        assert!(generated.key_prefix.starts_with(API_KEY_PREFIX));
    }

    #[test]
    fn keys_are_unique() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a.key, b.key);
        assert_ne!(a.key_hash, b.key_hash);
    }

    #[test]
    fn format_rejects_wrong_prefix_and_length() {
        assert!(!is_valid_api_key_format("sk_abc"));
        assert!(!is_valid_api_key_format("evr_1234"));
        assert!(!is_valid_api_key_format(&format!("evr_{}", "g".repeat(64))));
    }
}
