//! Authenticated encryption for session payloads.
//!
//! Payloads are sealed with XChaCha20-Poly1305. Every call to [`encrypt`] draws a
//! fresh 192-bit nonce from the operating system RNG, and the sealed output is laid
//! out as `nonce || ciphertext || tag`. Decryption walks a [`KeyRing`] in order so
//! that retired keys keep opening existing sessions during a key rotation.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a session key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;
/// Size of the XChaCha20 nonce prepended to every sealed payload (192 bits).
pub const NONCE_SIZE: usize = 24;
/// Size of the Poly1305 authentication tag.
pub const TAG_SIZE: usize = 16;

const KDF_SALT: &[u8] = b"hs-session/v1";
const KDF_INFO: &[u8] = b"session cookie encryption key";

/// Errors raised while sealing or opening session payloads
#[derive(Error, Debug)]
pub enum CodecError {
    /// The input cannot possibly be a sealed payload (bad base64, too short).
    #[error("Malformed session payload: {0}")]
    Malformed(String),

    /// None of the configured keys could authenticate the payload.
    #[error("Session payload failed authentication")]
    Authentication,

    #[error("Session payload encryption failed")]
    Encryption,

    #[error("At least one encryption key is required")]
    NoKeys,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// A 256-bit symmetric key. The key material is wiped when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derives a key from a configured secret string with HKDF-SHA256.
    pub fn derive(secret: &str) -> Result<Self, CodecError> {
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret.as_bytes());
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|e| CodecError::KeyDerivation(e.to_string()))?;
        Ok(Self(okm))
    }

    /// Generates a random key from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretKey {}

/// Ordered list of keys. The first key encrypts, every key is tried on decrypt.
///
/// Cloning is cheap: the keys live behind an `Arc` and are shared read-only by
/// every request.
#[derive(Clone, Debug)]
pub struct KeyRing(Arc<[SecretKey]>);

impl KeyRing {
    pub fn new(keys: Vec<SecretKey>) -> Self {
        Self(keys.into())
    }

    /// Builds a key ring from secret strings, leftmost secret first.
    pub fn from_secrets<I, S>(secrets: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = secrets
            .into_iter()
            .map(|secret| SecretKey::derive(secret.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(keys))
    }

    /// The key used to encrypt new payloads
    pub fn current(&self) -> Option<&SecretKey> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecretKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Seals `plaintext` under `key`, returning `nonce || ciphertext || tag`.
pub fn encrypt(plaintext: &[u8], key: &SecretKey) -> Result<Vec<u8>, CodecError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let sealed = key
        .cipher()
        .encrypt(&nonce, plaintext)
        .map_err(|_| CodecError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Opens a payload produced by [`encrypt`], trying each key of the ring in order.
///
/// Returns [`CodecError::Authentication`] when no key verifies the payload. A wrong
/// key and a tampered payload are indistinguishable here on purpose.
pub fn decrypt(ciphertext: &[u8], keys: &KeyRing) -> Result<Vec<u8>, CodecError> {
    if keys.is_empty() {
        return Err(CodecError::NoKeys);
    }
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CodecError::Malformed(format!(
            "expected at least {} bytes, got {}",
            NONCE_SIZE + TAG_SIZE,
            ciphertext.len()
        )));
    }

    let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce);

    keys.iter()
        .find_map(|key| key.cipher().decrypt(nonce, sealed).ok())
        .ok_or(CodecError::Authentication)
}

/// Renders a sealed payload as a cookie value (standard base64 alphabet, unpadded).
pub fn to_cookie_value(sealed: &[u8]) -> String {
    STANDARD_NO_PAD.encode(sealed)
}

/// Parses a cookie value produced by [`to_cookie_value`].
pub fn from_cookie_value(value: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD_NO_PAD
        .decode(value)
        .map_err(|e| CodecError::Malformed(format!("invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(secrets: &[&str]) -> KeyRing {
        KeyRing::from_secrets(secrets).unwrap()
    }

    #[test]
    fn test_round_trip_with_current_key() {
        let keys = ring(&["secret", "old1", "old2"]);
        let sealed = encrypt(b"hello session", keys.current().unwrap()).unwrap();

        assert_eq!(sealed.len(), NONCE_SIZE + b"hello session".len() + TAG_SIZE);
        assert_eq!(decrypt(&sealed, &keys).unwrap(), b"hello session");
    }

    #[test]
    fn test_rotation_accepts_retired_key() {
        let old = ring(&["old"]);
        let sealed = encrypt(b"payload", old.current().unwrap()).unwrap();

        let new_only = ring(&["new"]);
        assert!(matches!(
            decrypt(&sealed, &new_only),
            Err(CodecError::Authentication)
        ));

        let rotated = ring(&["new", "old"]);
        assert_eq!(decrypt(&sealed, &rotated).unwrap(), b"payload");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let keys = ring(&["secret"]);
        let key = keys.current().unwrap();

        let first = encrypt(b"same", key).unwrap();
        let second = encrypt(b"same", key).unwrap();

        assert_ne!(first[..NONCE_SIZE], second[..NONCE_SIZE]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let keys = ring(&["secret", "old"]);
        let mut sealed = encrypt(b"important", keys.current().unwrap()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(decrypt(&sealed, &keys), Err(CodecError::Authentication)));

        let mut sealed = encrypt(b"important", keys.current().unwrap()).unwrap();
        sealed[3] ^= 0x80;
        assert!(matches!(decrypt(&sealed, &keys), Err(CodecError::Authentication)));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let keys = ring(&["secret"]);
        let sealed = encrypt(b"x", keys.current().unwrap()).unwrap();

        let result = decrypt(&sealed[..NONCE_SIZE + 4], &keys);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_empty_key_ring() {
        let keys = KeyRing::new(Vec::new());
        assert!(keys.current().is_none());
        assert!(matches!(
            decrypt(&[0u8; 64], &keys),
            Err(CodecError::NoKeys)
        ));
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = SecretKey::derive("secret").unwrap();
        let b = SecretKey::derive("secret").unwrap();
        let c = SecretKey::derive("Secret").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{:?}", a), "SecretKey(..)");
    }

    #[test]
    fn test_generated_keys_round_trip() {
        let key = SecretKey::generate();
        let keys = KeyRing::new(vec![key.clone()]);
        let sealed = encrypt(b"random key", &key).unwrap();
        assert_eq!(decrypt(&sealed, &keys).unwrap(), b"random key");
    }

    #[test]
    fn test_cookie_value_encoding() {
        let keys = ring(&["secret"]);
        let sealed = encrypt(b"cookie", keys.current().unwrap()).unwrap();
        let value = to_cookie_value(&sealed);

        assert!(!value.ends_with('='));
        assert_eq!(from_cookie_value(&value).unwrap(), sealed);
        assert!(matches!(
            from_cookie_value("not base64!"),
            Err(CodecError::Malformed(_))
        ));
    }
}
