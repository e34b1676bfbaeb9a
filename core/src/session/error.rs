use crate::address::ProtocolAddress;
use crate::crypto::keys::KeyError;
use crate::crypto::x3dh::X3DHError;
use crate::protocol::CodecError;

/// Errors surfaced by session building, encryption and decryption
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid prekey bundle signature")]
    InvalidSignature,
    #[error("Untrusted identity for {0}")]
    UntrustedIdentity(ProtocolAddress),
    #[error("No session with {0}")]
    NoSession(ProtocolAddress),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Duplicate message with counter {counter}")]
    DuplicateMessage { counter: u32 },
    #[error("Message counter {counter} too far ahead of chain at {current}")]
    MessageCounterTooLarge { counter: u32, current: u32 },
    #[error("Invalid key")]
    InvalidKey,
    #[error("Signed prekey {0} not found")]
    StaleKey(u32),
    #[error("One-time prekey {0} not found")]
    MissingPreKey(u32),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SessionError {
    /// Trust failures ask for re-verification rather than a dropped message
    pub fn is_untrusted_identity(&self) -> bool {
        matches!(self, Self::UntrustedIdentity(_))
    }
}

impl From<KeyError> for SessionError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::InvalidKey => Self::InvalidKey,
            KeyError::DecryptionFailed => Self::InvalidMessage("decryption failed".into()),
            other => Self::InvalidMessage(other.to_string()),
        }
    }
}

impl From<X3DHError> for SessionError {
    fn from(e: X3DHError) -> Self {
        match e {
            X3DHError::InvalidSignature => Self::InvalidSignature,
            X3DHError::Key(key) => key.into(),
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}
