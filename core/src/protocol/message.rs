//! Signal and PreKey messages
//!
//! ```text
//! CiphertextMessage = type:u8 || body
//! SignalMessage     = version:u8 || ratchetKey[32] || counter:u32 || previousCounter:u32
//!                     || ciphertext:varbytes<u32> || mac[8]
//! PreKeyMessage     = version:u8 || registrationId:u32 || hasPreKey:u8 [|| preKeyId:u32]
//!                     || signedPreKeyId:u32 || baseKey[32] || identityKey[32]
//!                     || message:varbytes<u32>
//! ```

use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::keys::{IdentityKey, KeyError};
use crate::crypto::primitives::{self, MAC_LENGTH};
use crate::protocol::codec::{CodecError, Reader, Writer};

/// Session version carried by every message
pub const CIPHERTEXT_MESSAGE_CURRENT_VERSION: u8 = 3;

fn version_byte(message_version: u8) -> u8 {
    (message_version << 4) | CIPHERTEXT_MESSAGE_CURRENT_VERSION
}

fn parse_version(reader: &mut Reader<'_>) -> Result<u8, CodecError> {
    let byte = reader.read_u8()?;
    let version = byte >> 4;
    if version != CIPHERTEXT_MESSAGE_CURRENT_VERSION {
        return Err(CodecError::Invalid("unsupported message version"));
    }
    Ok(version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CiphertextMessageType {
    Whisper = 0x01,
    PreKey = 0x03,
}

impl TryFrom<u8> for CiphertextMessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Whisper),
            0x03 => Ok(Self::PreKey),
            _ => Err(CodecError::Invalid("unknown message type")),
        }
    }
}

/// A ratchet-encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    message_version: u8,
    ratchet_key: X25519PublicKey,
    counter: u32,
    previous_counter: u32,
    ciphertext: Vec<u8>,
    serialized: Vec<u8>,
}

impl SignalMessage {
    /// Build and authenticate a message. The MAC binds both identities.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_version: u8,
        mac_key: &[u8; 32],
        ratchet_key: X25519PublicKey,
        counter: u32,
        previous_counter: u32,
        ciphertext: Vec<u8>,
        sender_identity: &IdentityKey,
        receiver_identity: &IdentityKey,
    ) -> Result<Self, KeyError> {
        let mut writer = Writer::new();
        writer.write_u8(version_byte(message_version));
        writer.write_bytes(ratchet_key.as_bytes());
        writer.write_u32(counter);
        writer.write_u32(previous_counter);
        writer.write_varbytes_u32(&ciphertext);

        let mac = Self::compute_mac(sender_identity, receiver_identity, mac_key, writer.as_slice())?;
        writer.write_bytes(&mac);

        Ok(Self {
            message_version,
            ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized: writer.into_vec(),
        })
    }

    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    pub fn ratchet_key(&self) -> &X25519PublicKey {
        &self.ratchet_key
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn body(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    /// Constant-time MAC check over the received bytes
    pub fn verify_mac(
        &self,
        sender_identity: &IdentityKey,
        receiver_identity: &IdentityKey,
        mac_key: &[u8; 32],
    ) -> bool {
        let split = self.serialized.len() - MAC_LENGTH;
        let (content, mac) = self.serialized.split_at(split);
        let input = Self::mac_input(sender_identity, receiver_identity, content);
        primitives::hmac_verify(mac_key, &input, mac)
    }

    fn mac_input(sender: &IdentityKey, receiver: &IdentityKey, content: &[u8]) -> Vec<u8> {
        let mut input = Vec::with_capacity(64 + content.len());
        input.extend_from_slice(&sender.to_bytes());
        input.extend_from_slice(&receiver.to_bytes());
        input.extend_from_slice(content);
        input
    }

    fn compute_mac(
        sender: &IdentityKey,
        receiver: &IdentityKey,
        mac_key: &[u8; 32],
        content: &[u8],
    ) -> Result<[u8; MAC_LENGTH], KeyError> {
        let tag = primitives::hmac_auth(mac_key, &Self::mac_input(sender, receiver, content))?;
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&tag[..MAC_LENGTH]);
        Ok(mac)
    }
}

impl TryFrom<&[u8]> for SignalMessage {
    type Error = CodecError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let mut reader = Reader::new(bytes);
        let message_version = parse_version(&mut reader)?;
        let ratchet_key = X25519PublicKey::from(reader.read_exact::<32>()?);
        let counter = reader.read_u32()?;
        let previous_counter = reader.read_u32()?;
        let ciphertext = reader.read_varbytes_u32()?;
        let _mac: [u8; MAC_LENGTH] = reader.read_exact()?;
        reader.finish()?;

        Ok(Self {
            message_version,
            ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized: bytes.to_vec(),
        })
    }
}

/// First message(s) of a session, carrying what the responder needs for X3DH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    message_version: u8,
    registration_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: X25519PublicKey,
    identity_key: IdentityKey,
    message: SignalMessage,
    serialized: Vec<u8>,
}

impl PreKeyMessage {
    pub fn new(
        message_version: u8,
        registration_id: u32,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: X25519PublicKey,
        identity_key: IdentityKey,
        message: SignalMessage,
    ) -> Self {
        let mut writer = Writer::new();
        writer.write_u8(version_byte(message_version));
        writer.write_u32(registration_id);
        match pre_key_id {
            Some(id) => {
                writer.write_u8(1);
                writer.write_u32(id);
            }
            None => writer.write_u8(0),
        }
        writer.write_u32(signed_pre_key_id);
        writer.write_bytes(base_key.as_bytes());
        writer.write_bytes(&identity_key.to_bytes());
        writer.write_varbytes_u32(message.serialized());

        Self {
            message_version,
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
            serialized: writer.into_vec(),
        }
    }

    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn pre_key_id(&self) -> Option<u32> {
        self.pre_key_id
    }

    pub fn signed_pre_key_id(&self) -> u32 {
        self.signed_pre_key_id
    }

    pub fn base_key(&self) -> &X25519PublicKey {
        &self.base_key
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn message(&self) -> &SignalMessage {
        &self.message
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for PreKeyMessage {
    type Error = CodecError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let mut reader = Reader::new(bytes);
        let message_version = parse_version(&mut reader)?;
        let registration_id = reader.read_u32()?;
        let pre_key_id = match reader.read_u8()? {
            0 => None,
            1 => Some(reader.read_u32()?),
            _ => return Err(CodecError::Invalid("prekey flag")),
        };
        let signed_pre_key_id = reader.read_u32()?;
        let base_key = X25519PublicKey::from(reader.read_exact::<32>()?);
        let identity_key = IdentityKey::from_bytes(&reader.read_exact::<32>()?)
            .map_err(|_| CodecError::Invalid("identity key"))?;
        let inner = reader.read_varbytes_u32()?;
        reader.finish()?;

        let message = SignalMessage::try_from(inner.as_slice())?;

        Ok(Self {
            message_version,
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
            serialized: bytes.to_vec(),
        })
    }
}

/// Output of `SessionCipher::encrypt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiphertextMessage {
    Whisper(SignalMessage),
    PreKey(PreKeyMessage),
}

impl CiphertextMessage {
    pub fn message_type(&self) -> CiphertextMessageType {
        match self {
            Self::Whisper(_) => CiphertextMessageType::Whisper,
            Self::PreKey(_) => CiphertextMessageType::PreKey,
        }
    }

    /// Discriminator byte followed by the message body
    pub fn serialize(&self) -> Vec<u8> {
        let body = match self {
            Self::Whisper(m) => m.serialized(),
            Self::PreKey(m) => m.serialized(),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.message_type() as u8);
        out.extend_from_slice(body);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&kind, body) = bytes.split_first().ok_or(CodecError::Truncated)?;
        match CiphertextMessageType::try_from(kind)? {
            CiphertextMessageType::Whisper => Ok(Self::Whisper(SignalMessage::try_from(body)?)),
            CiphertextMessageType::PreKey => Ok(Self::PreKey(PreKeyMessage::try_from(body)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{IdentityKeyPair, KeyPair};

    fn signal_message(sender: &IdentityKey, receiver: &IdentityKey) -> SignalMessage {
        SignalMessage::new(
            CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            &[7u8; 32],
            KeyPair::generate().public_key(),
            3,
            1,
            b"ciphertext".to_vec(),
            sender,
            receiver,
        )
        .unwrap()
    }

    #[test]
    fn test_signal_message_parse_and_mac() {
        let alice = IdentityKeyPair::generate().identity_key();
        let bob = IdentityKeyPair::generate().identity_key();
        let message = signal_message(&alice, &bob);

        assert_eq!(message.serialized()[0], 0x33);

        let parsed = SignalMessage::try_from(message.serialized()).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.counter(), 3);
        assert_eq!(parsed.previous_counter(), 1);
        assert!(parsed.verify_mac(&alice, &bob, &[7u8; 32]));

        // Reversed identities or a different key fail
        assert!(!parsed.verify_mac(&bob, &alice, &[7u8; 32]));
        assert!(!parsed.verify_mac(&alice, &bob, &[8u8; 32]));
    }

    #[test]
    fn test_signal_message_tampered_body_fails_mac() {
        let alice = IdentityKeyPair::generate().identity_key();
        let bob = IdentityKeyPair::generate().identity_key();
        let mut bytes = signal_message(&alice, &bob).serialized().to_vec();
        bytes[40] ^= 0x01;

        let parsed = SignalMessage::try_from(bytes.as_slice()).unwrap();
        assert!(!parsed.verify_mac(&alice, &bob, &[7u8; 32]));
    }

    #[test]
    fn test_signal_message_rejects_bad_framing() {
        let alice = IdentityKeyPair::generate().identity_key();
        let bob = IdentityKeyPair::generate().identity_key();
        let bytes = signal_message(&alice, &bob).serialized().to_vec();

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert_eq!(SignalMessage::try_from(trailing.as_slice()), Err(CodecError::TrailingBytes));

        assert_eq!(
            SignalMessage::try_from(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated)
        );

        let mut old_version = bytes;
        old_version[0] = 0x22;
        assert!(matches!(
            SignalMessage::try_from(old_version.as_slice()),
            Err(CodecError::Invalid(_))
        ));
    }

    #[test]
    fn test_prekey_message_dispatch() {
        let alice = IdentityKeyPair::generate().identity_key();
        let bob = IdentityKeyPair::generate().identity_key();
        let base_key = KeyPair::generate().public_key();

        let prekey = PreKeyMessage::new(
            CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            1001,
            Some(2001),
            3001,
            base_key,
            alice,
            signal_message(&alice, &bob),
        );
        let bytes = CiphertextMessage::PreKey(prekey.clone()).serialize();
        assert_eq!(bytes[0], CiphertextMessageType::PreKey as u8);

        match CiphertextMessage::from_bytes(&bytes).unwrap() {
            CiphertextMessage::PreKey(parsed) => {
                assert_eq!(parsed, prekey);
                assert_eq!(parsed.registration_id(), 1001);
                assert_eq!(parsed.pre_key_id(), Some(2001));
                assert_eq!(parsed.signed_pre_key_id(), 3001);
                assert_eq!(parsed.identity_key(), &alice);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_prekey_message_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate().identity_key();
        let bob = IdentityKeyPair::generate().identity_key();

        let prekey = PreKeyMessage::new(
            CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            1001,
            None,
            3001,
            KeyPair::generate().public_key(),
            alice,
            signal_message(&alice, &bob),
        );
        let parsed = PreKeyMessage::try_from(prekey.serialized()).unwrap();
        assert_eq!(parsed.pre_key_id(), None);
        assert_eq!(parsed.message().counter(), 3);
    }

    #[test]
    fn test_unknown_type_byte() {
        assert!(matches!(
            CiphertextMessage::from_bytes(&[0x02, 0x33]),
            Err(CodecError::Invalid(_))
        ));
        assert_eq!(CiphertextMessage::from_bytes(&[]), Err(CodecError::Truncated));
    }
}
