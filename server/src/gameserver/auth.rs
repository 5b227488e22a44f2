//! Stateless-cookie authentication.
//!
//! The server never stores a per-peer secret between JOIN and AUTH. The
//! cookie binds the peer's address, its nonce and a timestamp under
//! HMAC-SHA256 of the shared secret; echoing it back within the timeout
//! window proves liveness. Verification walks every second of the window
//! and compares in constant time, so neither clock skew inside the window
//! nor timing leaks help an attacker.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::debug;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// A challenge must be answered within this window.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Window walked backwards when verifying a cookie, in seconds.
pub const AUTH_WINDOW_SECS: u64 = 5;
/// AUTH attempts tolerated per (address, client id) within one window.
pub const MAX_AUTH_ATTEMPTS: u8 = 3;
/// Decoded shared secret must carry at least this much material.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("R_TYPE_SHARED_SECRET is not set")]
    Missing,
    #[error("R_TYPE_SHARED_SECRET is not valid hex: {0}")]
    NotHex(#[from] hex::FromHexError),
    #[error("R_TYPE_SHARED_SECRET decodes to {0} octets, need at least {MIN_SECRET_LEN}")]
    TooShort(usize),
}

/// Reads and validates the shared secret from the environment. There is no
/// built-in fallback; a missing secret fails startup.
pub fn load_secret_from_env() -> Result<Vec<u8>, SecretError> {
    let raw = std::env::var("R_TYPE_SHARED_SECRET").map_err(|_| SecretError::Missing)?;
    let secret = hex::decode(raw.trim())?;
    if secret.len() < MIN_SECRET_LEN {
        return Err(SecretError::TooShort(secret.len()));
    }
    Ok(secret)
}

#[derive(Debug)]
struct AttemptEntry {
    count: u8,
    window_start: Instant,
}

/// Cookie computation, verification and the per-peer attempt ledger.
pub struct AuthEngine {
    secret: Vec<u8>,
    attempts: HashMap<([u8; 16], u32), AttemptEntry>,
}

impl AuthEngine {
    pub fn new(secret: Vec<u8>) -> Self {
        debug_assert!(secret.len() >= MIN_SECRET_LEN);
        Self {
            secret,
            attempts: HashMap::new(),
        }
    }

    /// `HMAC-SHA256(secret, ip ∥ nonce ∥ timestamp)`.
    pub fn cookie(&self, ip: &[u8; 16], nonce: u8, timestamp: u64) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(ip);
        mac.update(&[nonce]);
        mac.update(&timestamp.to_be_bytes());
        mac.finalize().into_bytes().into()
    }

    /// Mints a challenge for the current time.
    pub fn challenge(&self, ip: &[u8; 16], nonce: u8, now_secs: u64) -> (u64, [u8; 32]) {
        (now_secs, self.cookie(ip, nonce, now_secs))
    }

    /// Accepts a cookie iff some timestamp within the window reproduces it.
    /// Returns the matching timestamp so the session key can be derived
    /// from it deterministically.
    pub fn verify(
        &self,
        ip: &[u8; 16],
        nonce: u8,
        cookie: &[u8; 32],
        now_secs: u64,
    ) -> Option<u64> {
        for age in 0..=AUTH_WINDOW_SECS {
            let ts = now_secs.saturating_sub(age);
            let expected = self.cookie(ip, nonce, ts);
            if bool::from(expected.ct_eq(cookie)) {
                return Some(ts);
            }
        }
        None
    }

    /// `HKDF-SHA256(ikm = secret, salt = timestamp)`, 32-byte output.
    pub fn derive_session_key(&self, timestamp: u64) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(&timestamp.to_be_bytes()), &self.secret);
        let mut key = [0u8; 32];
        hk.expand(&[], &mut key)
            .expect("32 octets is a valid HKDF-SHA256 output length");
        key
    }

    /// Counts an AUTH attempt for `(ip, client id)`. Returns false once the
    /// cap for the current window is spent; such attempts are dropped
    /// silently by the caller.
    pub fn note_attempt(&mut self, ip: [u8; 16], client_id: u32, now: Instant) -> bool {
        let entry = self
            .attempts
            .entry((ip, client_id))
            .or_insert(AttemptEntry { count: 0, window_start: now });
        if now.duration_since(entry.window_start) > AUTH_TIMEOUT {
            entry.count = 0;
            entry.window_start = now;
        }
        if entry.count >= MAX_AUTH_ATTEMPTS {
            debug!("auth attempt cap reached for client {}", client_id);
            return false;
        }
        entry.count += 1;
        true
    }

    /// Forgets attempt ledgers whose window has passed.
    pub fn sweep(&mut self, now: Instant) {
        self.attempts
            .retain(|_, entry| now.duration_since(entry.window_start) <= AUTH_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> AuthEngine {
        AuthEngine::new(vec![0x5a; 32])
    }

    fn ip() -> [u8; 16] {
        let mut ip = [0u8; 16];
        ip[10] = 0xff;
        ip[11] = 0xff;
        ip[12..16].copy_from_slice(&[127, 0, 0, 1]);
        ip
    }

    #[test]
    fn cookie_is_deterministic_and_input_sensitive() {
        let engine = engine();
        let a = engine.cookie(&ip(), 0xab, 1_700_000_000);
        let b = engine.cookie(&ip(), 0xab, 1_700_000_000);
        assert_eq!(a, b);

        assert_ne!(a, engine.cookie(&ip(), 0xac, 1_700_000_000));
        assert_ne!(a, engine.cookie(&ip(), 0xab, 1_700_000_001));
        let mut other_ip = ip();
        other_ip[15] = 2;
        assert_ne!(a, engine.cookie(&other_ip, 0xab, 1_700_000_000));
    }

    #[test]
    fn round_trip_within_window_succeeds() {
        let engine = engine();
        let now = 1_700_000_000;
        let (ts, cookie) = engine.challenge(&ip(), 0xab, now);

        // Echoed back three seconds later: still inside the window.
        assert_eq!(engine.verify(&ip(), 0xab, &cookie, now + 3), Some(ts));
    }

    #[test]
    fn replay_after_window_is_rejected() {
        let engine = engine();
        let now = 1_700_000_000;
        let (_, cookie) = engine.challenge(&ip(), 0xab, now);

        assert_eq!(engine.verify(&ip(), 0xab, &cookie, now + 5), Some(now));
        assert_eq!(engine.verify(&ip(), 0xab, &cookie, now + 6), None);
    }

    #[test]
    fn wrong_nonce_or_address_is_rejected() {
        let engine = engine();
        let now = 1_700_000_000;
        let (_, cookie) = engine.challenge(&ip(), 0xab, now);

        assert_eq!(engine.verify(&ip(), 0xba, &cookie, now), None);
        let mut other_ip = ip();
        other_ip[15] = 9;
        assert_eq!(engine.verify(&other_ip, 0xab, &cookie, now), None);
    }

    #[test]
    fn session_key_matches_its_timestamp() {
        let engine = engine();
        let key = engine.derive_session_key(1_700_000_000);
        assert_eq!(key.len(), 32);
        assert_eq!(key, engine.derive_session_key(1_700_000_000));
        assert_ne!(key, engine.derive_session_key(1_700_000_001));
    }

    #[test]
    fn attempt_cap_is_three_per_window() {
        let mut engine = engine();
        let now = Instant::now();
        for _ in 0..MAX_AUTH_ATTEMPTS {
            assert!(engine.note_attempt(ip(), 7, now));
        }
        assert!(!engine.note_attempt(ip(), 7, now));

        // A different client id has its own ledger.
        assert!(engine.note_attempt(ip(), 8, now));

        // A fresh window resets the count.
        let later = now + AUTH_TIMEOUT + Duration::from_secs(1);
        assert!(engine.note_attempt(ip(), 7, later));
    }

    #[test]
    fn sweep_forgets_expired_ledgers() {
        let mut engine = engine();
        let now = Instant::now();
        engine.note_attempt(ip(), 7, now);
        engine.sweep(now + AUTH_TIMEOUT + Duration::from_secs(1));
        assert!(engine.attempts.is_empty());
    }
}
