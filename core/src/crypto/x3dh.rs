//! X3DH (Extended Triple Diffie-Hellman) key agreement
//!
//! Both sides concatenate the same DH outputs in the same order:
//!
//! ```text
//! 0xFF * 32 || DH(IK_A, SPK_B) || DH(EK_A, IK_B) || DH(EK_A, SPK_B) [|| DH(EK_A, OPK_B)]
//! ```
//!
//! and expand it with the `WhisperText` label into the first root key and
//! chain key of the session.

use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::Zeroizing;

use crate::crypto::keys::{IdentityKey, IdentityKeyPair, KeyError, KeyPair, PreKeyBundle};
use crate::crypto::primitives::{self, INFO_TEXT};
use crate::crypto::ratchet::{ChainKey, RootKey};

/// Leading discontinuity bytes, keeps X25519 outputs apart from other curve secrets
const DISCONTINUITY: [u8; 32] = [0xFF; 32];

/// X3DH result: the first keys of the session
pub struct X3DHSession {
    pub root_key: RootKey,
    pub chain_key: ChainKey,
    /// Initiator's ephemeral public key (sent to the responder)
    pub base_key: X25519PublicKey,
    /// Used one-time prekey ID (if any)
    pub used_one_time_prekey_id: Option<u32>,
}

/// X3DH errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum X3DHError {
    #[error("Invalid prekey bundle signature")]
    InvalidSignature,
    #[error(transparent)]
    Key(#[from] KeyError),
}

pub struct X3DH;

impl X3DH {
    /// Alice initiates X3DH with Bob's prekey bundle
    pub fn initiate(
        alice_identity: &IdentityKeyPair,
        alice_base_key: &KeyPair,
        bob_bundle: &PreKeyBundle,
    ) -> Result<X3DHSession, X3DHError> {
        if !bob_bundle.verify() {
            return Err(X3DHError::InvalidSignature);
        }

        let bob_signed_prekey = &bob_bundle.signed_pre_key.public_key;
        let bob_identity = bob_bundle.identity_key.dh_public_key();

        let mut secrets = Zeroizing::new(Vec::with_capacity(32 * 5));
        secrets.extend_from_slice(&DISCONTINUITY);
        // DH1 = DH(IK_A, SPK_B)
        secrets.extend_from_slice(&primitives::dh(alice_identity.dh_private_key(), bob_signed_prekey)?);
        // DH2 = DH(EK_A, IK_B)
        secrets.extend_from_slice(&alice_base_key.agree(&bob_identity)?);
        // DH3 = DH(EK_A, SPK_B)
        secrets.extend_from_slice(&alice_base_key.agree(bob_signed_prekey)?);
        // DH4 = DH(EK_A, OPK_B) if one-time prekey exists
        if let Some(one_time) = &bob_bundle.pre_key {
            secrets.extend_from_slice(&alice_base_key.agree(&one_time.public_key)?);
        }

        let (root_key, chain_key) = Self::derive_keys(&secrets)?;

        Ok(X3DHSession {
            root_key,
            chain_key,
            base_key: alice_base_key.public_key(),
            used_one_time_prekey_id: bob_bundle.pre_key.map(|k| k.id),
        })
    }

    /// Bob responds to Alice's X3DH initiation
    pub fn respond(
        bob_identity: &IdentityKeyPair,
        bob_signed_prekey: &KeyPair,
        bob_one_time_prekey: Option<(u32, &KeyPair)>,
        alice_identity_key: &IdentityKey,
        alice_base_key: &X25519PublicKey,
    ) -> Result<X3DHSession, X3DHError> {
        let alice_identity = alice_identity_key.dh_public_key();

        let mut secrets = Zeroizing::new(Vec::with_capacity(32 * 5));
        secrets.extend_from_slice(&DISCONTINUITY);
        // DH1 = DH(SPK_B, IK_A)
        secrets.extend_from_slice(&bob_signed_prekey.agree(&alice_identity)?);
        // DH2 = DH(IK_B, EK_A)
        secrets.extend_from_slice(&primitives::dh(bob_identity.dh_private_key(), alice_base_key)?);
        // DH3 = DH(SPK_B, EK_A)
        secrets.extend_from_slice(&bob_signed_prekey.agree(alice_base_key)?);
        // DH4 = DH(OPK_B, EK_A) if one-time prekey was used
        if let Some((_, one_time)) = bob_one_time_prekey {
            secrets.extend_from_slice(&one_time.agree(alice_base_key)?);
        }

        let (root_key, chain_key) = Self::derive_keys(&secrets)?;

        Ok(X3DHSession {
            root_key,
            chain_key,
            base_key: *alice_base_key,
            used_one_time_prekey_id: bob_one_time_prekey.map(|(id, _)| id),
        })
    }

    fn derive_keys(secrets: &[u8]) -> Result<(RootKey, ChainKey), KeyError> {
        let mut output = Zeroizing::new([0u8; 64]);
        primitives::kdf(&[secrets], None, INFO_TEXT, output.as_mut_slice())?;

        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&output[..32]);
        chain.copy_from_slice(&output[32..]);

        Ok((RootKey::new(root), ChainKey::new(chain, 0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{PreKeyRecord, SignedPreKeyRecord};

    fn bob_keys() -> (IdentityKeyPair, SignedPreKeyRecord, PreKeyRecord) {
        let identity = IdentityKeyPair::generate();
        let signed = SignedPreKeyRecord::generate(3001, &identity);
        let one_time = PreKeyRecord::generate(2001);
        (identity, signed, one_time)
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice_identity = IdentityKeyPair::generate();
        let (bob_identity, bob_signed, bob_one_time) = bob_keys();
        let bundle = PreKeyBundle::new(1002, 1, &bob_identity, &bob_signed, Some(&bob_one_time));

        let base_key = KeyPair::generate();
        let alice = X3DH::initiate(&alice_identity, &base_key, &bundle).unwrap();
        let bob = X3DH::respond(
            &bob_identity,
            bob_signed.key_pair(),
            Some((bob_one_time.id(), bob_one_time.key_pair())),
            &alice_identity.identity_key(),
            &alice.base_key,
        )
        .unwrap();

        assert_eq!(alice.root_key.key(), bob.root_key.key());
        assert_eq!(alice.chain_key.key(), bob.chain_key.key());
        assert_eq!(alice.used_one_time_prekey_id, Some(2001));
        assert_eq!(bob.used_one_time_prekey_id, Some(2001));
    }

    #[test]
    fn test_x3dh_without_one_time_prekey() {
        let alice_identity = IdentityKeyPair::generate();
        let (bob_identity, bob_signed, _) = bob_keys();
        let bundle = PreKeyBundle::new(1002, 1, &bob_identity, &bob_signed, None);

        let alice = X3DH::initiate(&alice_identity, &KeyPair::generate(), &bundle).unwrap();
        let bob = X3DH::respond(
            &bob_identity,
            bob_signed.key_pair(),
            None,
            &alice_identity.identity_key(),
            &alice.base_key,
        )
        .unwrap();

        assert_eq!(alice.root_key.key(), bob.root_key.key());
        assert_eq!(alice.used_one_time_prekey_id, None);
    }

    #[test]
    fn test_x3dh_missing_fourth_term_diverges() {
        let alice_identity = IdentityKeyPair::generate();
        let (bob_identity, bob_signed, bob_one_time) = bob_keys();
        let bundle = PreKeyBundle::new(1002, 1, &bob_identity, &bob_signed, Some(&bob_one_time));

        let alice = X3DH::initiate(&alice_identity, &KeyPair::generate(), &bundle).unwrap();
        let bob = X3DH::respond(
            &bob_identity,
            bob_signed.key_pair(),
            None,
            &alice_identity.identity_key(),
            &alice.base_key,
        )
        .unwrap();

        assert_ne!(alice.root_key.key(), bob.root_key.key());
    }

    #[test]
    fn test_x3dh_invalid_signature_fails() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();

        // Signed by the wrong identity
        let wrong_identity = IdentityKeyPair::generate();
        let bob_signed = SignedPreKeyRecord::generate(1, &wrong_identity);
        let bundle = PreKeyBundle::new(1002, 1, &bob_identity, &bob_signed, None);

        let result = X3DH::initiate(&alice_identity, &KeyPair::generate(), &bundle);
        assert!(matches!(result, Err(X3DHError::InvalidSignature)));
    }
}
