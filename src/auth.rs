//! Proxy authentication
//!
//! Every relayed request carries a fresh `ProxyAuthentication`:
//!
//! ```text
//! signature = HMAC-SHA256(secret_key, secret_id || timestamp || nonce)
//! ```
//!
//! `secret_id` is UTF-8, `timestamp` is milliseconds as a little-endian i64
//! (the byte order deployed peers hash with), `nonce` is 16 random bytes.
//! The remote agent accepts a token when it is less than 15 minutes away from
//! its own clock and matches any key registered for the secret id.

use crate::constants::{MAX_CLOCK_SKEW_MS, NONCE_SIZE};
use crate::error::ProxyError;
use crate::protocol::{Envelope, ProxyAuthentication};
use anyhow::anyhow;
use base64::engine::general_purpose::URL_SAFE as Base64Url;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Source of "now" in milliseconds since the Unix epoch
pub type Clock = fn() -> i64;

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Compute HMAC-SHA256
fn compute_hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, ProxyError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| ProxyError::Auth("Invalid HMAC key".into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Signature over `secret_id || timestamp || nonce` with `key`.
pub fn signature(
    secret_id: &str,
    timestamp: i64,
    nonce: &[u8],
    key: &[u8],
) -> Result<Vec<u8>, ProxyError> {
    compute_hmac_sha256(
        key,
        &[secret_id.as_bytes(), &timestamp.to_le_bytes(), nonce],
    )
}

/// Sign a fresh token for `secret_id` with the current time.
pub fn sign(secret_id: &str, secret_key: &str) -> Result<ProxyAuthentication, ProxyError> {
    AuthGenerator::new(secret_id, secret_key)
        .map_err(|e| ProxyError::Auth(e.to_string()))?
        .generate()
}

/// Produces tokens for one client identity
#[derive(Clone)]
pub struct AuthGenerator {
    secret_id: String,
    secret_key: Vec<u8>,
    clock: Clock,
}

impl std::fmt::Debug for AuthGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGenerator")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl AuthGenerator {
    pub fn new(secret_id: &str, secret_key: &str) -> anyhow::Result<Self> {
        Self::with_clock(secret_id, secret_key, now_millis)
    }

    pub fn with_clock(secret_id: &str, secret_key: &str, clock: Clock) -> anyhow::Result<Self> {
        if secret_id.is_empty() {
            return Err(anyhow!("Empty secret id"));
        }
        if secret_key.is_empty() {
            return Err(anyhow!("Empty secret key for secret id '{}'", secret_id));
        }
        Ok(Self {
            secret_id: secret_id.to_string(),
            secret_key: secret_key.as_bytes().to_vec(),
            clock,
        })
    }

    pub fn secret_id(&self) -> &str {
        &self.secret_id
    }

    pub fn generate(&self) -> Result<ProxyAuthentication, ProxyError> {
        let mut nonce = vec![0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let timestamp = (self.clock)();
        let signature = signature(&self.secret_id, timestamp, &nonce, &self.secret_key)?;
        Ok(ProxyAuthentication {
            secret_id: self.secret_id.clone(),
            timestamp,
            nonce,
            signature,
        })
    }

    /// A fresh token as base64url text for the auth header.
    pub fn header_value(&self) -> Result<String, ProxyError> {
        Ok(encode_header(&self.generate()?))
    }
}

pub fn encode_header(auth: &ProxyAuthentication) -> String {
    Base64Url.encode(auth.to_bytes())
}

/// Secret ids and their accepted keys, built once at startup
///
/// Several keys per id are allowed so a key can be rotated without downtime.
#[derive(Clone, Default)]
pub struct SecretTable {
    keys: HashMap<String, Vec<Vec<u8>>>,
}

impl std::fmt::Debug for SecretTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("SecretTable")
            .field("secret_ids", &ids)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

impl SecretTable {
    pub fn single(secret_id: &str, secret_key: &str) -> anyhow::Result<Self> {
        Self::from_entries([(secret_id, secret_key)])
    }

    /// Build from `(secret_id, secret_key)` pairs; repeated ids add keys.
    pub fn from_entries<I, K, V>(entries: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut keys: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for (secret_id, secret_key) in entries {
            let (secret_id, secret_key) = (secret_id.as_ref(), secret_key.as_ref());
            if secret_id.is_empty() {
                return Err(anyhow!("Empty secret id"));
            }
            if secret_key.is_empty() {
                return Err(anyhow!("Empty secret key for secret id '{}'", secret_id));
            }
            keys.entry(secret_id.to_string())
                .or_default()
                .push(secret_key.as_bytes().to_vec());
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn verify(&self, auth: &ProxyAuthentication) -> bool {
        self.verify_at(auth, now_millis())
    }

    /// Check `auth` against the table as if the current time were `now`.
    ///
    /// Nonces are not remembered, so a captured token can be replayed until
    /// it leaves the time window.
    pub fn verify_at(&self, auth: &ProxyAuthentication, now: i64) -> bool {
        if auth.secret_id.is_empty() || auth.nonce.is_empty() || auth.signature.is_empty() {
            debug!("Rejecting auth with missing fields");
            return false;
        }
        if now.abs_diff(auth.timestamp) > MAX_CLOCK_SKEW_MS as u64 {
            debug!(
                "Rejecting auth for '{}': timestamp {} too far from {}",
                auth.secret_id, auth.timestamp, now
            );
            return false;
        }
        let Some(candidates) = self.keys.get(&auth.secret_id) else {
            debug!("Rejecting auth for unknown secret id '{}'", auth.secret_id);
            return false;
        };

        // Plain equality, matching deployed validators.
        candidates.iter().any(|key| {
            signature(&auth.secret_id, auth.timestamp, &auth.nonce, key)
                .map(|expected| expected == auth.signature)
                .unwrap_or(false)
        })
    }

    /// Verify the base64url header value from the HTTP leg.
    pub fn verify_header(&self, value: Option<&str>) -> bool {
        match value.and_then(decode_header) {
            Some(auth) => self.verify(&auth),
            None => false,
        }
    }
}

/// Parse a header value; accepts padded and unpadded base64url.
pub fn decode_header(value: &str) -> Option<ProxyAuthentication> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let bytes = Base64Url
        .decode(value)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(value))
        .ok()?;
    ProxyAuthentication::from_bytes(&bytes).ok()
}

/// Random secret key suitable for the config files.
pub fn generate_secret_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn fixed_clock() -> i64 {
        NOW
    }

    #[test]
    fn test_sign_and_verify() {
        let table = SecretTable::single("id1", "key1").unwrap();
        let auth = sign("id1", "key1").unwrap();
        assert_eq!(auth.nonce.len(), NONCE_SIZE);
        assert_eq!(auth.signature.len(), 32);
        assert!(table.verify(&auth));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let auth = AuthGenerator::with_clock("id1", "key1", fixed_clock)
            .unwrap()
            .generate()
            .unwrap();
        let table = SecretTable::single("id1", "key2").unwrap();
        assert!(!table.verify_at(&auth, NOW));
    }

    #[test]
    fn test_unknown_secret_id_rejected() {
        let auth = AuthGenerator::with_clock("id1", "key1", fixed_clock)
            .unwrap()
            .generate()
            .unwrap();
        let table = SecretTable::single("other", "key1").unwrap();
        assert!(!table.verify_at(&auth, NOW));
    }

    #[test]
    fn test_time_window() {
        let auth = AuthGenerator::with_clock("id1", "key1", fixed_clock)
            .unwrap()
            .generate()
            .unwrap();
        let table = SecretTable::single("id1", "key1").unwrap();
        assert!(table.verify_at(&auth, NOW + MAX_CLOCK_SKEW_MS));
        assert!(table.verify_at(&auth, NOW - MAX_CLOCK_SKEW_MS));
        assert!(!table.verify_at(&auth, NOW + MAX_CLOCK_SKEW_MS + 1));
        assert!(!table.verify_at(&auth, NOW - MAX_CLOCK_SKEW_MS - 1));
    }

    #[test]
    fn test_rotated_keys_both_accepted() {
        let table =
            SecretTable::from_entries([("id1", "old"), ("id1", "new"), ("id2", "other")]).unwrap();
        assert_eq!(table.len(), 2);
        for key in ["old", "new"] {
            let auth = AuthGenerator::with_clock("id1", key, fixed_clock)
                .unwrap()
                .generate()
                .unwrap();
            assert!(table.verify_at(&auth, NOW));
        }
    }

    #[test]
    fn test_missing_fields_rejected() {
        let table = SecretTable::single("id1", "key1").unwrap();
        let valid = AuthGenerator::with_clock("id1", "key1", fixed_clock)
            .unwrap()
            .generate()
            .unwrap();

        let mut no_nonce = valid.clone();
        no_nonce.nonce.clear();
        assert!(!table.verify_at(&no_nonce, NOW));

        let mut no_signature = valid.clone();
        no_signature.signature.clear();
        assert!(!table.verify_at(&no_signature, NOW));

        let mut no_id = valid;
        no_id.secret_id.clear();
        assert!(!table.verify_at(&no_id, NOW));

        assert!(!table.verify_at(&ProxyAuthentication::default(), NOW));
    }

    #[test]
    fn test_tampered_timestamp_rejected() {
        let table = SecretTable::single("id1", "key1").unwrap();
        let mut auth = AuthGenerator::with_clock("id1", "key1", fixed_clock)
            .unwrap()
            .generate()
            .unwrap();
        auth.timestamp += 1;
        assert!(!table.verify_at(&auth, NOW));
    }

    #[test]
    fn test_same_token_verifies_twice() {
        let table = SecretTable::single("id1", "key1").unwrap();
        let auth = sign("id1", "key1").unwrap();
        assert!(table.verify(&auth));
        assert!(table.verify(&auth));
    }

    #[test]
    fn test_header_roundtrip() {
        let table = SecretTable::single("id1", "key1").unwrap();
        let generator = AuthGenerator::new("id1", "key1").unwrap();
        let header = generator.header_value().unwrap();
        assert!(!header.contains('+') && !header.contains('/'));
        assert!(table.verify_header(Some(&header)));
        assert!(table.verify_header(Some(header.trim_end_matches('='))));
    }

    #[test]
    fn test_bad_header_rejected() {
        let table = SecretTable::single("id1", "key1").unwrap();
        assert!(!table.verify_header(None));
        assert!(!table.verify_header(Some("")));
        assert!(!table.verify_header(Some("not base64 at all!")));
        assert!(!table.verify_header(Some(&Base64Url.encode(b"\x01\xff\xff\xff\xff"))));
    }

    #[test]
    fn test_empty_entries_rejected() {
        assert!(SecretTable::single("", "key").is_err());
        assert!(SecretTable::single("id", "").is_err());
        assert!(AuthGenerator::new("", "key").is_err());
        assert!(AuthGenerator::new("id", "").is_err());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let table = SecretTable::single("id1", "super-secret").unwrap();
        let generator = AuthGenerator::new("id1", "super-secret").unwrap();
        assert!(!format!("{:?}", table).contains("super-secret"));
        assert!(!format!("{:?}", generator).contains("super-secret"));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let nonce = [3u8; NONCE_SIZE];
        let a = signature("id1", NOW, &nonce, b"key1").unwrap();
        let b = signature("id1", NOW, &nonce, b"key1").unwrap();
        let c = signature("id1", NOW + 1, &nonce, b"key1").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
