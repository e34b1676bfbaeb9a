//! Cryptographic key types for session establishment
//!
//! Provides identity keys, ratchet/base key pairs, signed prekeys, one-time
//! prekeys and the published prekey bundle.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::primitives;
use crate::util::now_secs;

/// Public half of a long-term identity (Ed25519).
///
/// The X25519 form used in key agreement is the Montgomery image of the
/// verifying key, so one 32-byte value identifies a peer everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct IdentityKey(#[serde(with = "crate::util::serde_hex::verifying_key")] VerifyingKey);

impl IdentityKey {
    pub fn new(verifying_key: VerifyingKey) -> Self {
        Self(verifying_key)
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    /// X25519 public key for Diffie-Hellman
    pub fn dh_public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.0.to_montgomery().to_bytes())
    }

    /// Verify a signature made by the matching identity key pair
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> bool {
        primitives::verify_signature(&self.0, message, signature)
    }
}

/// Identity key pair (Ed25519 for signing, X25519 derived for key exchange)
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    dh_private: StaticSecret,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        // Clamped Ed25519 scalar doubles as the X25519 private key
        let dh_private = StaticSecret::from(signing_key.to_scalar_bytes());
        Self {
            signing_key,
            dh_private,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey(self.signing_key.verifying_key())
    }

    pub fn dh_public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.dh_private)
    }

    pub(crate) fn dh_private_key(&self) -> &StaticSecret {
        &self.dh_private
    }

    /// Sign data with Ed25519
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Serialize the 32-byte seed (for storage)
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Restore from a stored seed
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("identity_key", &hex::encode(self.identity_key().to_bytes()))
            .finish_non_exhaustive()
    }
}

/// X25519 key pair used for base keys, ratchet keys and prekeys
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "crate::util::serde_hex::static_secret")]
    private_key: StaticSecret,
    #[serde(with = "crate::util::serde_hex::x25519")]
    public_key: X25519PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private_key(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_private_key(private_key: StaticSecret) -> Self {
        let public_key = X25519PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    /// Diffie-Hellman with a remote public key
    pub fn agree(&self, their_public: &X25519PublicKey) -> Result<[u8; 32], KeyError> {
        primitives::dh(&self.private_key, their_public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Signed prekey (medium-term, signed by identity key)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    id: u32,
    key_pair: KeyPair,
    #[serde(with = "crate::util::serde_hex::signature")]
    signature: Signature,
    timestamp: u64,
}

impl SignedPreKeyRecord {
    /// Generate a new signed prekey
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(key_pair.public_key().as_bytes());

        Self {
            id,
            key_pair,
            signature,
            timestamp: now_secs(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.key_pair.public_key()
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Verify signature against identity public key
    pub fn verify(&self, identity: &IdentityKey) -> bool {
        identity.verify_signature(self.public_key().as_bytes(), &self.signature.to_bytes())
    }
}

/// One-time prekey (consumed by at most one handshake)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyRecord {
    id: u32,
    key_pair: KeyPair,
}

impl PreKeyRecord {
    pub fn new(id: u32, key_pair: KeyPair) -> Self {
        Self { id, key_pair }
    }

    /// Generate a new one-time prekey
    pub fn generate(id: u32) -> Self {
        Self::new(id, KeyPair::generate())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.key_pair.public_key()
    }
}

/// Public part of a one-time prekey inside a bundle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePreKey {
    pub id: u32,
    #[serde(with = "crate::util::serde_hex::x25519")]
    pub public_key: X25519PublicKey,
}

/// Public part of a signed prekey inside a bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSignedPreKey {
    pub id: u32,
    #[serde(with = "crate::util::serde_hex::x25519")]
    pub public_key: X25519PublicKey,
    #[serde(with = "crate::util::serde_hex")]
    pub signature: Vec<u8>,
}

/// Bundle of public keys a peer publishes for asynchronous session setup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub identity_key: IdentityKey,
    pub pre_key: Option<BundlePreKey>,
    pub signed_pre_key: BundleSignedPreKey,
}

impl PreKeyBundle {
    /// Create a bundle from our keys
    pub fn new(
        registration_id: u32,
        device_id: u32,
        identity: &IdentityKeyPair,
        signed_pre_key: &SignedPreKeyRecord,
        pre_key: Option<&PreKeyRecord>,
    ) -> Self {
        Self {
            registration_id,
            device_id,
            identity_key: identity.identity_key(),
            pre_key: pre_key.map(|k| BundlePreKey {
                id: k.id(),
                public_key: k.public_key(),
            }),
            signed_pre_key: BundleSignedPreKey {
                id: signed_pre_key.id(),
                public_key: signed_pre_key.public_key(),
                signature: signed_pre_key.signature().to_bytes().to_vec(),
            },
        }
    }

    /// Verify the signed prekey signature
    pub fn verify(&self) -> bool {
        self.identity_key.verify_signature(
            self.signed_pre_key.public_key.as_bytes(),
            &self.signed_pre_key.signature,
        )
    }
}

/// Key-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key")]
    InvalidKey,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
}
