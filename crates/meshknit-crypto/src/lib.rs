//! Meshknit Cryptographic Primitives
//!
//! Per-peer symmetric channels for the overlay:
//! - Key derivation (SHA-256 over shared secret + mesh address)
//! - Authenticated encryption (ChaCha20-Poly1305)
//!
//! Keys are derived deterministically from the mesh-wide shared secret and
//! the peer's overlay address, so two nodes that agree on the secret can
//! encrypt to each other without a key-exchange round trip.

pub mod channel;
pub mod error;

pub use channel::{derive_key, open, seal, ChannelKey};
pub use error::{CryptoError, CryptoResult};

/// Protocol constants
pub mod constants {
    /// ChaCha20-Poly1305 key size
    pub const KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const TAG_SIZE: usize = 16;

    /// Fixed ciphertext overhead (nonce prefix + tag)
    pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
}
