//! Whisper Core Library
//!
//! Asynchronous, forward-secure end-to-end encryption between two parties:
//! X3DH session establishment followed by the Double Ratchet.
//!
//! ```text
//! SessionBuilder ──► SessionRecord ──► SessionStore
//! SessionCipher  ──► SessionState (ratchet engine) ──► crypto primitives
//! ```

pub mod address;
pub mod config;
pub mod crypto;
pub mod logger;
pub mod protocol;
pub mod session;
pub mod store;
mod util;

pub use address::ProtocolAddress;
pub use config::ProtocolConfig;
pub use logger::{init_logger, init_stderr_logger, LogSink};

pub use crypto::{
    IdentityKey, IdentityKeyPair, KeyPair, PreKeyBundle, PreKeyRecord, SignedPreKeyRecord,
};
pub use protocol::{CiphertextMessage, CiphertextMessageType, PreKeyMessage, SignalMessage};
pub use session::{SessionBuilder, SessionCipher, SessionError, SessionRecord, SessionState};
pub use store::{
    Direction, IdentityKeyStore, InMemProtocolStore, PreKeyStore, ProtocolContext, ProtocolStore,
    SessionStore, SignedPreKeyStore,
};
