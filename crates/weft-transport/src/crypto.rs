//! Application-layer body encryption.
//!
//! Frame bodies (never headers) can be sealed with AES-256-GCM keyed by
//! the 32-byte secret the TLS exporter derives. The sealed layout is
//! `nonce(12) || ciphertext(n) || tag(16)` with empty AAD; the nonce is
//! drawn fresh from the system RNG per message. Empty bodies are never
//! sealed (the `ENCRYPTED` flag stays clear for them).

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// Error from sealing or opening a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed (body too large for GCM).
    Seal,
    /// Tag verification failed or the ciphertext is malformed.
    Open,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Seal => f.write_str("body encryption failed"),
            CryptoError::Open => f.write_str("body decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// AES-256-GCM body cipher.
pub struct AppCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AppCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCipher").finish_non_exhaustive()
    }
}

impl AppCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Seal a body: `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed body, verifying the tag.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Open);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AppCipher {
        AppCipher::new(&[0x42; KEY_LEN])
    }

    #[test]
    fn roundtrip_various_sizes() {
        let c = cipher();
        for len in [0usize, 1, 16, 17, 1024, 64 * 1024] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = c.seal(&plaintext).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
            assert_eq!(c.open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn sealed_echo_body_is_45_bytes() {
        // 12-byte nonce + 17-byte payload + 16-byte tag.
        let sealed = cipher().seal(b"hello from client").unwrap();
        assert_eq!(sealed.len(), 45);
    }

    #[test]
    fn tampering_any_byte_fails_open() {
        let c = cipher();
        let sealed = c.seal(b"payload under test").unwrap();
        for i in 0..sealed.len() {
            let mut bad = sealed.clone();
            bad[i] ^= 0x01;
            assert_eq!(c.open(&bad), Err(CryptoError::Open), "byte {i}");
        }
    }

    #[test]
    fn wrong_key_fails_open() {
        let sealed = cipher().seal(b"secret").unwrap();
        let other = AppCipher::new(&[0x43; KEY_LEN]);
        assert_eq!(other.open(&sealed), Err(CryptoError::Open));
    }

    #[test]
    fn truncated_input_fails_open() {
        let c = cipher();
        let sealed = c.seal(b"x").unwrap();
        assert_eq!(c.open(&sealed[..NONCE_LEN + TAG_LEN - 1]), Err(CryptoError::Open));
        assert_eq!(c.open(&[]), Err(CryptoError::Open));
    }

    #[test]
    fn nonces_are_fresh_per_message() {
        let c = cipher();
        let a = c.seal(b"same plaintext").unwrap();
        let b = c.seal(b"same plaintext").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }
}
