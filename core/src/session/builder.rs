use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::ProtocolAddress;
use crate::crypto::keys::{KeyPair, PreKeyBundle};
use crate::crypto::x3dh::X3DH;
use crate::protocol::PreKeyMessage;
use crate::session::error::SessionError;
use crate::session::record::SessionRecord;
use crate::session::state::{PendingPreKey, SessionState};
use crate::store::{Direction, ProtocolContext, ProtocolStore};

/// Builds sessions with one remote address
pub struct SessionBuilder<S> {
    context: Arc<ProtocolContext<S>>,
    remote_address: ProtocolAddress,
}

impl<S: ProtocolStore> SessionBuilder<S> {
    pub fn new(context: Arc<ProtocolContext<S>>, remote_address: ProtocolAddress) -> Self {
        Self {
            context,
            remote_address,
        }
    }

    pub fn remote_address(&self) -> &ProtocolAddress {
        &self.remote_address
    }

    /// Initiator side of X3DH
    ///
    /// Verifies the bundle, derives the first root and chain keys and makes
    /// the new state current. Messages encrypted with it are sent as prekey
    /// messages until the peer replies.
    pub async fn process_pre_key_bundle(&self, bundle: &PreKeyBundle) -> Result<(), SessionError> {
        let store = &self.context.store;
        let _guard = self.context.locks.lock(&self.remote_address).await;

        let identity = store.identity_key_pair().await?;
        let base_key = KeyPair::generate();
        let x3dh = X3DH::initiate(&identity, &base_key, bundle).inspect_err(|_| {
            warn!(address = %self.remote_address, "Rejected prekey bundle");
        })?;

        if !store
            .is_trusted_identity(&self.remote_address, &bundle.identity_key, Direction::Sending)
            .await?
        {
            return Err(SessionError::UntrustedIdentity(self.remote_address.clone()));
        }

        let pending = PendingPreKey {
            pre_key_id: x3dh.used_one_time_prekey_id,
            signed_pre_key_id: bundle.signed_pre_key.id,
            base_key: x3dh.base_key,
        };
        let state = SessionState::new_initiator(
            identity.identity_key(),
            bundle.identity_key,
            store.local_registration_id().await?,
            bundle.registration_id,
            x3dh,
            bundle.signed_pre_key.public_key,
            pending,
        )?;

        let mut record = store.load_session(&self.remote_address).await?.unwrap_or_default();
        record.promote_state(state, &self.context.config);

        store.store_session(&self.remote_address, &record).await?;
        store.save_identity(&self.remote_address, &bundle.identity_key).await?;

        info!(
            address = %self.remote_address,
            pre_key_id = ?pending.pre_key_id,
            signed_pre_key_id = pending.signed_pre_key_id,
            "Session initiated"
        );
        Ok(())
    }

    /// Responder side of X3DH, run by the cipher with the address lock held,
    /// plus the prekey lock when a one-time prekey may be consumed.
    ///
    /// Installs a new current state in `record` unless one from the same
    /// handshake already exists. Returns the one-time prekey id to remove
    /// once the message has decrypted.
    pub(crate) async fn process_pre_key_message(
        &self,
        record: &mut SessionRecord,
        message: &PreKeyMessage,
    ) -> Result<Option<u32>, SessionError> {
        if record.has_session_state(message.base_key()) {
            debug!(address = %self.remote_address, "Prekey message for existing session");
            return Ok(None);
        }

        let store = &self.context.store;

        let signed_pre_key = store
            .load_signed_pre_key(message.signed_pre_key_id())
            .await?
            .ok_or(SessionError::StaleKey(message.signed_pre_key_id()))?;

        let one_time_pre_key = match message.pre_key_id() {
            Some(id) => match store.load_pre_key(id).await? {
                Some(record) => Some(record),
                None => {
                    warn!(
                        address = %self.remote_address,
                        pre_key_id = id,
                        "Prekey message names a consumed prekey, refusing to bootstrap twice"
                    );
                    return Err(SessionError::MissingPreKey(id));
                }
            },
            None => None,
        };

        let identity = store.identity_key_pair().await?;
        let x3dh = X3DH::respond(
            &identity,
            signed_pre_key.key_pair(),
            one_time_pre_key.as_ref().map(|k| (k.id(), k.key_pair())),
            message.identity_key(),
            message.base_key(),
        )?;

        let state = SessionState::new_responder(
            identity.identity_key(),
            *message.identity_key(),
            store.local_registration_id().await?,
            message.registration_id(),
            x3dh,
            signed_pre_key.key_pair().clone(),
        );
        record.promote_state(state, &self.context.config);

        info!(
            address = %self.remote_address,
            pre_key_id = ?message.pre_key_id(),
            signed_pre_key_id = message.signed_pre_key_id(),
            "Session accepted"
        );
        Ok(message.pre_key_id())
    }
}
