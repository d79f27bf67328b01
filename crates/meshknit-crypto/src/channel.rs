//! Per-peer symmetric channel
//!
//! Every peer owns one symmetric key derived from the mesh-wide shared
//! secret and the peer's 32-bit overlay address. Datagrams addressed to a
//! peer are sealed under that peer's key; the receiving node opens inbound
//! ciphertext with its own key. The open path operates on bytes received
//! from untrusted remotes, so every length is checked before slicing.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{KEY_SIZE, NONCE_SIZE, SEAL_OVERHEAD};
use crate::error::{CryptoError, CryptoResult};

/// A 256-bit channel key bound to one peer identity
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey {
    bytes: [u8; KEY_SIZE],
}

impl ChannelKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

/// Derive the channel key for a peer.
///
/// SHA-256 over the shared secret bytes followed by the 4-byte big-endian
/// mesh address. Deterministic: both sides derive the same key for the same
/// recorded address without any key-exchange round trip.
pub fn derive_key(secret: &str, addr: u32) -> ChannelKey {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(addr.to_be_bytes());
    ChannelKey::from_bytes(hasher.finalize().into())
}

/// Seal a payload under a channel key.
///
/// Output layout: `nonce (12) || ciphertext || tag (16)`. A fresh random
/// nonce is drawn per call; the cipher is constructed per call so no shared
/// context or lock is needed.
pub fn seal(key: &ChannelKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("ChaCha20-Poly1305 encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open sealed data.
///
/// Fails cleanly on truncated, corrupted, or foreign-key input; never reads
/// past the input bounds.
pub fn open(key: &ChannelKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < SEAL_OVERHEAD {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TAG_SIZE;

    #[test]
    fn test_derive_deterministic() {
        let a = derive_key("orange juice", 0x0a000001);
        let b = derive_key("orange juice", 0x0a000001);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_address_sensitive() {
        let a = derive_key("orange juice", 0x0a000001);
        let b = derive_key("orange juice", 0x0a000002);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_secret_sensitive() {
        let a = derive_key("orange juice", 0x0a000001);
        let b = derive_key("apple juice", 0x0a000001);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_seal_open_round_trip_all_lengths() {
        let key = derive_key("secret", 1);
        // 0 up to a typical tun MTU
        for len in (0..=1400).step_by(97).chain([0usize, 1, 1400]) {
            let plaintext = vec![0xA5u8; len];
            let sealed = seal(&key, &plaintext).unwrap();
            assert_eq!(sealed.len(), len + SEAL_OVERHEAD);
            let opened = open(&key, &sealed).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_open_corrupted_fails() {
        let key = derive_key("secret", 1);
        let mut sealed = seal(&key, b"payload").unwrap();
        for i in 0..sealed.len() {
            sealed[i] ^= 0xFF;
            assert!(open(&key, &sealed).is_err());
            sealed[i] ^= 0xFF;
        }
    }

    #[test]
    fn test_open_truncated_fails() {
        let key = derive_key("secret", 1);
        let sealed = seal(&key, b"payload").unwrap();
        for len in 0..sealed.len() {
            assert!(open(&key, &sealed[..len]).is_err());
        }
        // Degenerate inputs shorter than the fixed overhead
        assert!(open(&key, &[]).is_err());
        assert!(open(&key, &[0u8; NONCE_SIZE + TAG_SIZE - 1]).is_err());
    }

    #[test]
    fn test_open_foreign_key_fails() {
        let ours = derive_key("secret", 1);
        let theirs = derive_key("other secret", 1);
        let sealed = seal(&theirs, b"payload").unwrap();
        assert!(open(&ours, &sealed).is_err());
    }
}
