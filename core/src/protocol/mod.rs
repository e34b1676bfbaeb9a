//! Wire formats
//!
//! Every serialized message starts with a discriminator byte so a receiver
//! can route it without out-of-band hints, followed by a version byte.

mod codec;
mod message;

pub use codec::{CodecError, Reader, Writer};
pub use message::{
    CiphertextMessage, CiphertextMessageType, PreKeyMessage, SignalMessage,
    CIPHERTEXT_MESSAGE_CURRENT_VERSION,
};
