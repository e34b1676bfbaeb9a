//! Session establishment and the ratchet engine
//!
//! - `SessionBuilder` runs the initiator side of X3DH from a prekey bundle.
//! - `SessionCipher` encrypts and decrypts, installing responder sessions
//!   from incoming prekey messages.
//! - `SessionRecord` / `SessionState` hold ratchet progress per address.

mod builder;
mod cipher;
mod error;
mod record;
mod skipped;
mod state;

pub use builder::SessionBuilder;
pub use cipher::SessionCipher;
pub use error::SessionError;
pub use record::SessionRecord;
pub use skipped::SkippedKeyCache;
pub use state::{PendingPreKey, SessionState};
