//! Key-agreement primitives
//!
//! Stateless building blocks used by both the handshake and the ratchet:
//! X25519 agreement, HKDF-SHA256 expansion, Ed25519 verification,
//! HMAC-SHA256 authentication and the AES-256-GCM body cipher.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::keys::KeyError;

type HmacSha256 = Hmac<Sha256>;

/// HKDF info label for the initial X3DH secret
pub const INFO_TEXT: &[u8] = b"WhisperText";
/// HKDF info label for a root-key (DH ratchet) step
pub const INFO_RATCHET: &[u8] = b"WhisperRatchet";
/// HKDF info label for message key material
pub const INFO_MESSAGE_KEYS: &[u8] = b"WhisperMessageKeys";
/// HKDF info label for advancing a chain key
pub const INFO_CHAIN_KEY: &[u8] = b"WhisperChainKey";

/// Length of the truncated message MAC on the wire
pub const MAC_LENGTH: usize = 8;

/// X25519 agreement. Rejects non-contributory results (low-order points).
pub fn dh(private_key: &StaticSecret, public_key: &X25519PublicKey) -> Result<[u8; 32], KeyError> {
    let shared = private_key.diffie_hellman(public_key);
    if !shared.was_contributory() {
        return Err(KeyError::InvalidKey);
    }
    Ok(shared.to_bytes())
}

/// HKDF-SHA256 over the concatenation of `inputs`, filling `output`.
pub fn kdf(
    inputs: &[&[u8]],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), KeyError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(inputs.iter().map(|i| i.len()).sum()));
    for input in inputs {
        ikm.extend_from_slice(input);
    }

    Hkdf::<Sha256>::new(salt, &ikm)
        .expand(info, output)
        .map_err(|_| KeyError::KeyDerivationFailed)
}

/// Ed25519 signature check. Malformed signatures verify as false.
pub fn verify_signature(public_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    public_key.verify_strict(message, &signature).is_ok()
}

pub fn hmac_auth(key: &[u8], message: &[u8]) -> Result<[u8; 32], KeyError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| KeyError::InvalidKey)?;
    mac.update(message);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Constant-time check of a (possibly truncated) HMAC-SHA256 tag.
pub fn hmac_verify(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        return false;
    };
    mac.update(message);
    mac.verify_truncated_left(tag).is_ok()
}

pub fn aead_encrypt(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| KeyError::EncryptionFailed)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| KeyError::EncryptionFailed)
}

pub fn aead_decrypt(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| KeyError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeyError::DecryptionFailed)
}
