//! Cryptographic building blocks
//!
//! - Key-agreement primitives (X25519, HKDF-SHA256, HMAC-SHA256, AES-256-GCM)
//! - Identity and prekey types
//! - X3DH (Extended Triple Diffie-Hellman) key agreement
//! - Root, chain and message key schedule for the Double Ratchet

pub mod keys;
pub mod primitives;
pub mod ratchet;
pub mod x3dh;

pub use keys::{
    BundlePreKey, BundleSignedPreKey, IdentityKey, IdentityKeyPair, KeyError, KeyPair,
    PreKeyBundle, PreKeyRecord, SignedPreKeyRecord,
};
pub use ratchet::{ChainKey, MessageKeys, RootKey};
pub use x3dh::{X3DHError, X3DHSession, X3DH};
