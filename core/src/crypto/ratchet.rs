//! Ratchet key schedule
//!
//! Root keys feed the DH ratchet, chain keys feed the symmetric ratchet, and
//! message keys are derived once per chain position. Every step is a one-way
//! HKDF expansion under its own label.

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::keys::{KeyError, KeyPair};
use crate::crypto::primitives::{self, INFO_CHAIN_KEY, INFO_MESSAGE_KEYS, INFO_RATCHET};

/// Root key for the DH ratchet
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    #[serde(with = "crate::util::serde_hex::bytes32")]
    key: [u8; 32],
}

impl RootKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// One DH ratchet step: `(rk', ck) = KDF(DH(ours, theirs), rk)`
    pub fn create_chain(
        &self,
        their_ratchet_key: &X25519PublicKey,
        our_ratchet_key: &KeyPair,
    ) -> Result<(RootKey, ChainKey), KeyError> {
        let shared = Zeroizing::new(our_ratchet_key.agree(their_ratchet_key)?);

        let mut output = Zeroizing::new([0u8; 64]);
        primitives::kdf(&[shared.as_slice()], Some(self.key.as_slice()), INFO_RATCHET, output.as_mut_slice())?;

        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&output[..32]);
        chain.copy_from_slice(&output[32..]);

        Ok((RootKey::new(root), ChainKey::new(chain, 0)))
    }
}

/// Chain key for the symmetric ratchet
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    #[serde(with = "crate::util::serde_hex::bytes32")]
    key: [u8; 32],
    counter: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], counter: u32) -> Self {
        Self { key, counter }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Position of the next message key on this chain
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Advance one step. The current key cannot be recovered from the result.
    pub fn next_chain_key(&self) -> Result<ChainKey, KeyError> {
        let counter = self.counter.checked_add(1).ok_or(KeyError::KeyDerivationFailed)?;
        let mut key = [0u8; 32];
        primitives::kdf(&[self.key.as_slice()], None, INFO_CHAIN_KEY, &mut key)?;
        Ok(ChainKey::new(key, counter))
    }

    /// Message keys for the current counter
    pub fn message_keys(&self) -> Result<MessageKeys, KeyError> {
        let mut output = Zeroizing::new([0u8; 76]);
        primitives::kdf(&[self.key.as_slice()], None, INFO_MESSAGE_KEYS, output.as_mut_slice())?;

        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut nonce = [0u8; 12];
        cipher_key.copy_from_slice(&output[..32]);
        mac_key.copy_from_slice(&output[32..64]);
        nonce.copy_from_slice(&output[64..]);

        Ok(MessageKeys {
            cipher_key,
            mac_key,
            nonce,
            counter: self.counter,
        })
    }
}

/// Single-use keys for one message: body cipher key, MAC key and nonce
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    #[serde(with = "crate::util::serde_hex::bytes32")]
    cipher_key: [u8; 32],
    #[serde(with = "crate::util::serde_hex::bytes32")]
    mac_key: [u8; 32],
    #[serde(with = "crate::util::serde_hex::bytes12")]
    nonce: [u8; 12],
    counter: u32,
}

impl MessageKeys {
    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        primitives::aead_encrypt(&self.cipher_key, &self.nonce, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        primitives::aead_decrypt(&self.cipher_key, &self.nonce, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_chain_key_derivation() {
        let chain = ChainKey::new([0u8; 32], 0);
        let next = chain.next_chain_key().unwrap();

        assert_eq!(next.counter(), 1);
        assert_ne!(chain.key(), next.key());
        assert_ne!(
            chain.message_keys().unwrap().cipher_key(),
            next.message_keys().unwrap().cipher_key()
        );
    }

    #[test]
    fn test_message_keys_pairwise_distinct() {
        let mut chain = ChainKey::new([5u8; 32], 0);
        let mut seen = HashSet::new();

        for expected in 0..64 {
            let keys = chain.message_keys().unwrap();
            assert_eq!(keys.counter(), expected);
            assert!(seen.insert(*keys.cipher_key()));
            assert!(seen.insert(*keys.mac_key()));
            chain = chain.next_chain_key().unwrap();
        }
    }

    #[test]
    fn test_message_key_differs_from_next_chain_key() {
        let chain = ChainKey::new([5u8; 32], 0);
        let keys = chain.message_keys().unwrap();
        let next = chain.next_chain_key().unwrap();
        assert_ne!(keys.cipher_key(), next.key());
        assert_ne!(keys.mac_key(), next.key());
    }

    #[test]
    fn test_chain_counter_overflow() {
        let chain = ChainKey::new([5u8; 32], u32::MAX);
        assert!(chain.next_chain_key().is_err());
    }

    #[test]
    fn test_root_key_create_chain_agrees() {
        let root = RootKey::new([8u8; 32]);
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let (alice_root, alice_chain) = root.create_chain(&bob.public_key(), &alice).unwrap();
        let (bob_root, bob_chain) = root.create_chain(&alice.public_key(), &bob).unwrap();

        assert_eq!(alice_root.key(), bob_root.key());
        assert_eq!(alice_chain.key(), bob_chain.key());
        assert_ne!(alice_root.key(), root.key());
    }

    #[test]
    fn test_message_keys_encrypt_decrypt() {
        let keys = ChainKey::new([1u8; 32], 0).message_keys().unwrap();
        let ciphertext = keys.encrypt(b"Hello, World!").unwrap();
        assert_eq!(keys.decrypt(&ciphertext).unwrap(), b"Hello, World!");

        let other = ChainKey::new([2u8; 32], 0).message_keys().unwrap();
        assert!(other.decrypt(&ciphertext).is_err());
    }
}
