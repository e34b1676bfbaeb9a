use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::ProtocolAddress;
use crate::config::ProtocolConfig;
use crate::protocol::{CiphertextMessage, PreKeyMessage, SignalMessage};
use crate::session::builder::SessionBuilder;
use crate::session::error::SessionError;
use crate::session::record::SessionRecord;
use crate::session::state::SessionState;
use crate::store::{Direction, ProtocolContext, ProtocolStore};

/// Encrypts and decrypts messages for one remote address
///
/// Every call takes the address lock, loads the record, works on a copy of
/// the state and stores the record only if the whole call succeeded.
pub struct SessionCipher<S> {
    context: Arc<ProtocolContext<S>>,
    remote_address: ProtocolAddress,
}

impl<S: ProtocolStore> SessionCipher<S> {
    pub fn new(context: Arc<ProtocolContext<S>>, remote_address: ProtocolAddress) -> Self {
        Self {
            context,
            remote_address,
        }
    }

    pub fn remote_address(&self) -> &ProtocolAddress {
        &self.remote_address
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<CiphertextMessage, SessionError> {
        let store = &self.context.store;
        let _guard = self.context.locks.lock(&self.remote_address).await;

        let mut record = self.load_record().await?;
        let state = record
            .session_state_mut()
            .ok_or_else(|| SessionError::NoSession(self.remote_address.clone()))?;

        let remote_identity = *state.remote_identity_key();
        if !store
            .is_trusted_identity(&self.remote_address, &remote_identity, Direction::Sending)
            .await?
        {
            return Err(SessionError::UntrustedIdentity(self.remote_address.clone()));
        }

        let previous_counter = state.previous_counter();
        let ratchet_key = state.sender_ratchet_key();
        let keys = state.ratchet_sending()?;
        let ciphertext = keys.encrypt(plaintext)?;

        let message = SignalMessage::new(
            state.session_version(),
            keys.mac_key(),
            ratchet_key,
            keys.counter(),
            previous_counter,
            ciphertext,
            state.local_identity_key(),
            &remote_identity,
        )?;

        let message = match state.pending_pre_key() {
            Some(pending) => CiphertextMessage::PreKey(PreKeyMessage::new(
                state.session_version(),
                state.local_registration_id(),
                pending.pre_key_id,
                pending.signed_pre_key_id,
                pending.base_key,
                *state.local_identity_key(),
                message,
            )),
            None => CiphertextMessage::Whisper(message),
        };

        store.store_session(&self.remote_address, &record).await?;

        debug!(
            address = %self.remote_address,
            counter = keys.counter(),
            message_type = ?message.message_type(),
            "Encrypted message"
        );
        Ok(message)
    }

    /// Decrypt either message type, routed on the leading type byte
    pub async fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        match CiphertextMessage::from_bytes(bytes)? {
            CiphertextMessage::PreKey(message) => self.decrypt_pre_key(&message).await,
            CiphertextMessage::Whisper(message) => self.decrypt_whisper(&message).await,
        }
    }

    /// Decrypt a prekey message, installing the responder session if needed.
    /// The one-time prekey is removed only after the message decrypts.
    pub async fn decrypt_pre_key_message(&self, bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        match CiphertextMessage::from_bytes(bytes)? {
            CiphertextMessage::PreKey(message) => self.decrypt_pre_key(&message).await,
            CiphertextMessage::Whisper(_) => {
                Err(SessionError::InvalidMessage("expected a prekey message".into()))
            }
        }
    }

    pub async fn decrypt_message(&self, bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        match CiphertextMessage::from_bytes(bytes)? {
            CiphertextMessage::Whisper(message) => self.decrypt_whisper(&message).await,
            CiphertextMessage::PreKey(_) => {
                Err(SessionError::InvalidMessage("expected a whisper message".into()))
            }
        }
    }

    pub async fn remote_registration_id(&self) -> Result<u32, SessionError> {
        Ok(self.current_state().await?.remote_registration_id())
    }

    pub async fn session_version(&self) -> Result<u8, SessionError> {
        Ok(self.current_state().await?.session_version())
    }

    pub async fn has_open_session(&self) -> Result<bool, SessionError> {
        Ok(self
            .context
            .store
            .load_session(&self.remote_address)
            .await?
            .is_some_and(|record| record.has_current_state()))
    }

    /// Archive the current session so nothing more is sent with it. Archived
    /// states still decrypt late messages. Returns false if there was no
    /// open session.
    pub async fn close_open_session(&self) -> Result<bool, SessionError> {
        let store = &self.context.store;
        let _guard = self.context.locks.lock(&self.remote_address).await;

        let Some(mut record) = store.load_session(&self.remote_address).await? else {
            return Ok(false);
        };
        if !record.archive_current_state(&self.context.config) {
            return Ok(false);
        }
        store.store_session(&self.remote_address, &record).await?;

        info!(address = %self.remote_address, "Closed open session");
        Ok(true)
    }

    /// Forget every state held for this address
    pub async fn delete_session(&self) -> Result<(), SessionError> {
        let _guard = self.context.locks.lock(&self.remote_address).await;
        self.context.store.delete_session(&self.remote_address).await?;
        info!(address = %self.remote_address, "Deleted session");
        Ok(())
    }

    /// Delete the sessions of every device registered under this address's
    /// name, each under its own address lock. Returns how many were deleted.
    pub async fn delete_all_sessions(&self) -> Result<usize, SessionError> {
        let store = &self.context.store;
        let name = self.remote_address.name();
        let devices = store.sub_device_sessions(name).await?;

        for &device_id in &devices {
            let address = ProtocolAddress::new(name, device_id);
            let _guard = self.context.locks.lock(&address).await;
            store.delete_session(&address).await?;
        }

        info!(remote = name, devices = devices.len(), "Deleted all sessions");
        Ok(devices.len())
    }

    async fn decrypt_pre_key(&self, message: &PreKeyMessage) -> Result<Vec<u8>, SessionError> {
        let store = &self.context.store;
        let _guard = self.context.locks.lock(&self.remote_address).await;

        if !store
            .is_trusted_identity(&self.remote_address, message.identity_key(), Direction::Receiving)
            .await?
        {
            return Err(SessionError::UntrustedIdentity(self.remote_address.clone()));
        }

        let mut record = store
            .load_session(&self.remote_address)
            .await?
            .unwrap_or_default();
        record.remove_expired_states(&self.context.config);

        let _pre_key_guard = match message.pre_key_id() {
            Some(_) if !record.has_session_state(message.base_key()) => {
                Some(self.context.locks.lock_pre_keys().await)
            }
            _ => None,
        };

        let builder = SessionBuilder::new(self.context.clone(), self.remote_address.clone());
        let used_pre_key = builder.process_pre_key_message(&mut record, message).await?;

        let plaintext = self
            .decrypt_with_record(&mut record, message.message())
            .inspect_err(|e| warn!(address = %self.remote_address, error = %e, "Rejected prekey message"))?;

        store.store_session(&self.remote_address, &record).await?;
        if let Some(id) = used_pre_key {
            store.remove_pre_key(id).await?;
        }
        store.save_identity(&self.remote_address, message.identity_key()).await?;

        Ok(plaintext)
    }

    async fn decrypt_whisper(&self, message: &SignalMessage) -> Result<Vec<u8>, SessionError> {
        let store = &self.context.store;
        let _guard = self.context.locks.lock(&self.remote_address).await;

        let mut record = self.load_record().await?;
        let remote_identity = record
            .session_state()
            .or_else(|| record.previous_states().next())
            .map(|state| *state.remote_identity_key())
            .ok_or_else(|| SessionError::NoSession(self.remote_address.clone()))?;

        if !store
            .is_trusted_identity(&self.remote_address, &remote_identity, Direction::Receiving)
            .await?
        {
            return Err(SessionError::UntrustedIdentity(self.remote_address.clone()));
        }

        let plaintext = self
            .decrypt_with_record(&mut record, message)
            .inspect_err(|e| warn!(address = %self.remote_address, error = %e, "Rejected message"))?;

        store.store_session(&self.remote_address, &record).await?;
        Ok(plaintext)
    }

    async fn load_record(&self) -> Result<SessionRecord, SessionError> {
        self.context
            .store
            .load_session(&self.remote_address)
            .await?
            .ok_or_else(|| SessionError::NoSession(self.remote_address.clone()))
    }

    async fn current_state(&self) -> Result<SessionState, SessionError> {
        let record = self.load_record().await?;
        record
            .session_state()
            .cloned()
            .ok_or_else(|| SessionError::NoSession(self.remote_address.clone()))
    }

    /// Try the current state, then archived ones, each on a copy. A state
    /// that already knows the message's ratchet key gives the final answer.
    /// An archived state that decrypts is promoted to current.
    fn decrypt_with_record(
        &self,
        record: &mut SessionRecord,
        message: &SignalMessage,
    ) -> Result<Vec<u8>, SessionError> {
        let config = &self.context.config;
        let mut first_error = None;

        let expired = record.remove_expired_states(config);
        if expired > 0 {
            debug!(address = %self.remote_address, expired, "Dropped expired archived sessions");
        }

        if let Some(current) = record.session_state() {
            let mut state = current.clone();
            let known_chain = state.has_receiver_chain(message.ratchet_key());
            match decrypt_with_state(&mut state, message, config) {
                Ok(plaintext) => {
                    record.set_session_state(state);
                    return Ok(plaintext);
                }
                Err(e) if known_chain => return Err(e),
                Err(e) => first_error = Some(e),
            }
        }

        for index in 0..record.previous_state_count() {
            let Some(previous) = record.previous_state(index) else {
                break;
            };
            let mut state = previous.clone();
            let known_chain = state.has_receiver_chain(message.ratchet_key());
            match decrypt_with_state(&mut state, message, config) {
                Ok(plaintext) => {
                    info!(address = %self.remote_address, index, "Promoting archived session");
                    record.promote_previous_state(index, state, config);
                    return Ok(plaintext);
                }
                Err(e) if known_chain => return Err(e),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or_else(|| SessionError::NoSession(self.remote_address.clone())))
    }
}

fn decrypt_with_state(
    state: &mut SessionState,
    message: &SignalMessage,
    config: &ProtocolConfig,
) -> Result<Vec<u8>, SessionError> {
    if message.message_version() != state.session_version() {
        return Err(SessionError::InvalidMessage(format!(
            "version {} does not match session version {}",
            message.message_version(),
            state.session_version()
        )));
    }

    let keys = state.ratchet_receiving(
        message.ratchet_key(),
        message.counter(),
        message.previous_counter(),
        config,
    )?;

    if !message.verify_mac(state.remote_identity_key(), state.local_identity_key(), keys.mac_key()) {
        return Err(SessionError::InvalidMessage("bad mac".into()));
    }

    let plaintext = keys.decrypt(message.body())?;
    state.clear_pending_pre_key();
    Ok(plaintext)
}
