//! Session record: every state held for one remote address
//!
//! The current state is used for sending. Archived states are kept, bounded
//! by count and age, only to decrypt messages that were in flight when a new
//! session replaced them. An archived state that decrypts becomes current
//! again, so both sides settle on the session the peer is sending with.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::config::ProtocolConfig;
use crate::session::error::SessionError;
use crate::session::state::SessionState;
use crate::util::now_secs;

#[derive(Clone, Serialize, Deserialize)]
struct ArchivedState {
    state: SessionState,
    archived_at: u64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    /// Most recently archived first
    previous: VecDeque<ArchivedState>,
}

impl SessionRecord {
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            previous: VecDeque::new(),
        }
    }

    pub fn session_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub(crate) fn session_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    pub(crate) fn set_session_state(&mut self, state: SessionState) {
        self.current = Some(state);
    }

    pub fn has_current_state(&self) -> bool {
        self.current.is_some()
    }

    pub fn previous_state_count(&self) -> usize {
        self.previous.len()
    }

    pub fn previous_states(&self) -> impl Iterator<Item = &SessionState> {
        self.previous.iter().map(|archived| &archived.state)
    }

    pub(crate) fn previous_state(&self, index: usize) -> Option<&SessionState> {
        self.previous.get(index).map(|archived| &archived.state)
    }

    /// Replace the archived state at `index` with `state` and make it
    /// current, archiving the existing current state
    pub(crate) fn promote_previous_state(
        &mut self,
        index: usize,
        state: SessionState,
        config: &ProtocolConfig,
    ) {
        if self.previous.remove(index).is_some() {
            self.promote_state(state, config);
        }
    }

    /// Whether any state, current or archived, came from the handshake with
    /// this base key
    pub fn has_session_state(&self, base_key: &X25519PublicKey) -> bool {
        self.current
            .iter()
            .chain(self.previous_states())
            .any(|state| state.base_key() == base_key)
    }

    /// Make `state` current, archiving the existing current state
    pub fn promote_state(&mut self, state: SessionState, config: &ProtocolConfig) {
        self.archive_current_state(config);
        self.current = Some(state);
    }

    /// Archive the current state so it is no longer used for sending.
    /// Returns false when there was nothing to archive.
    pub fn archive_current_state(&mut self, config: &ProtocolConfig) -> bool {
        let Some(state) = self.current.take() else {
            return false;
        };

        self.previous.push_front(ArchivedState {
            state,
            archived_at: now_secs(),
        });
        self.prune(config);
        true
    }

    /// Drop archived states older than the configured max age. Returns the
    /// number removed.
    pub fn remove_expired_states(&mut self, config: &ProtocolConfig) -> usize {
        let max_age = config.archived_state_max_age.as_secs();
        let now = now_secs();
        let before = self.previous.len();

        self.previous
            .retain(|archived| now.saturating_sub(archived.archived_at) <= max_age);
        before - self.previous.len()
    }

    fn prune(&mut self, config: &ProtocolConfig) {
        self.remove_expired_states(config);
        self.previous.truncate(config.max_archived_states);
    }

    /// Opaque blob handed to the session store
    pub fn serialize(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(self).map_err(|e| SessionError::Storage(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{IdentityKeyPair, KeyPair, SignedPreKeyRecord};
    use crate::crypto::x3dh::X3DH;
    use std::time::Duration;

    fn responder_state() -> SessionState {
        let bob_identity = IdentityKeyPair::generate();
        let alice_identity = IdentityKeyPair::generate();
        let signed = SignedPreKeyRecord::generate(1, &bob_identity);
        let base_key = KeyPair::generate().public_key();

        let x3dh = X3DH::respond(
            &bob_identity,
            signed.key_pair(),
            None,
            &alice_identity.identity_key(),
            &base_key,
        )
        .unwrap();
        SessionState::new_responder(
            bob_identity.identity_key(),
            alice_identity.identity_key(),
            1002,
            1001,
            x3dh,
            signed.key_pair().clone(),
        )
    }

    #[test]
    fn test_promote_archives_current() {
        let config = ProtocolConfig::default();
        let first = responder_state();
        let first_base = *first.base_key();

        let mut record = SessionRecord::new(first);
        let second = responder_state();
        let second_base = *second.base_key();
        record.promote_state(second, &config);

        assert_eq!(record.session_state().unwrap().base_key(), &second_base);
        assert_eq!(record.previous_state_count(), 1);
        assert!(record.has_session_state(&first_base));
        assert!(record.has_session_state(&second_base));
        assert!(!record.has_session_state(&KeyPair::generate().public_key()));
    }

    #[test]
    fn test_archived_states_bounded_by_count() {
        let config = ProtocolConfig {
            max_archived_states: 3,
            ..ProtocolConfig::default()
        };
        let mut record = SessionRecord::default();
        for _ in 0..6 {
            record.promote_state(responder_state(), &config);
        }

        assert!(record.has_current_state());
        assert_eq!(record.previous_state_count(), 3);
    }

    #[test]
    fn test_archived_states_bounded_by_age() {
        let config = ProtocolConfig {
            archived_state_max_age: Duration::from_secs(60),
            ..ProtocolConfig::default()
        };
        let mut record = SessionRecord::new(responder_state());
        record.archive_current_state(&config);
        record.previous[0].archived_at -= 120;

        record.promote_state(responder_state(), &config);
        record.archive_current_state(&config);

        assert!(!record.has_current_state());
        assert_eq!(record.previous_state_count(), 1);
    }

    #[test]
    fn test_expired_states_removed_without_new_archive() {
        let config = ProtocolConfig {
            archived_state_max_age: Duration::from_secs(60),
            ..ProtocolConfig::default()
        };
        let mut record = SessionRecord::new(responder_state());
        record.promote_state(responder_state(), &config);
        record.promote_state(responder_state(), &config);
        record.previous[1].archived_at -= 120;

        assert_eq!(record.remove_expired_states(&config), 1);
        assert_eq!(record.previous_state_count(), 1);
        assert!(record.has_current_state());
        assert_eq!(record.remove_expired_states(&config), 0);
    }

    #[test]
    fn test_promote_previous_state_swaps_current() {
        let config = ProtocolConfig::default();
        let first = responder_state();
        let first_base = *first.base_key();
        let mut record = SessionRecord::new(first);
        let second = responder_state();
        let second_base = *second.base_key();
        record.promote_state(second, &config);

        let archived = record.previous_state(0).unwrap().clone();
        record.promote_previous_state(0, archived, &config);

        assert_eq!(record.session_state().unwrap().base_key(), &first_base);
        assert_eq!(record.previous_state_count(), 1);
        assert_eq!(record.previous_state(0).unwrap().base_key(), &second_base);

        // Out of range leaves the record alone
        record.promote_previous_state(5, responder_state(), &config);
        assert_eq!(record.session_state().unwrap().base_key(), &first_base);
    }

    #[test]
    fn test_archive_without_current_state() {
        let mut record = SessionRecord::default();
        assert!(!record.archive_current_state(&ProtocolConfig::default()));
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = ProtocolConfig::default();
        let mut record = SessionRecord::new(responder_state());
        record.promote_state(responder_state(), &config);
        let base_key = *record.session_state().unwrap().base_key();

        let bytes = record.serialize().unwrap();
        let restored = SessionRecord::deserialize(&bytes).unwrap();

        assert_eq!(restored.session_state().unwrap().base_key(), &base_key);
        assert_eq!(restored.previous_state_count(), 1);
        assert!(SessionRecord::deserialize(b"not json").is_err());
    }
}
