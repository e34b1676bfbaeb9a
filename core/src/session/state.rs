//! Session state: the ratchet progress for one remote device
//!
//! A state owns its root key, one sending chain, a bounded list of receiving
//! chains and the skipped message key cache. It is mutated in place by the
//! cipher, which always works on a clone and commits only on success.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::config::ProtocolConfig;
use crate::crypto::keys::{IdentityKey, KeyPair};
use crate::crypto::ratchet::{ChainKey, MessageKeys, RootKey};
use crate::crypto::x3dh::X3DHSession;
use crate::protocol::CIPHERTEXT_MESSAGE_CURRENT_VERSION;
use crate::session::error::SessionError;
use crate::session::skipped::SkippedKeyCache;

/// Handshake fields the initiator repeats until the responder answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    #[serde(with = "crate::util::serde_hex::x25519")]
    pub base_key: X25519PublicKey,
}

#[derive(Clone, Serialize, Deserialize)]
struct SenderChain {
    ratchet_key_pair: KeyPair,
    chain_key: ChainKey,
}

#[derive(Clone, Serialize, Deserialize)]
struct ReceiverChain {
    #[serde(with = "crate::util::serde_hex::x25519")]
    ratchet_key: X25519PublicKey,
    chain_key: ChainKey,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    session_version: u8,
    local_identity_key: IdentityKey,
    remote_identity_key: IdentityKey,
    local_registration_id: u32,
    remote_registration_id: u32,
    root_key: RootKey,
    sender_chain: SenderChain,
    receiver_chains: VecDeque<ReceiverChain>,
    #[serde(with = "crate::util::serde_hex::x25519_opt")]
    remote_ratchet_key: Option<X25519PublicKey>,
    previous_counter: u32,
    pending_pre_key: Option<PendingPreKey>,
    /// Initiator's X3DH base key, identifies the handshake this state came from
    #[serde(with = "crate::util::serde_hex::x25519")]
    base_key: X25519PublicKey,
    skipped_keys: SkippedKeyCache,
}

impl SessionState {
    /// Initiator side. The first sending chain is already ratcheted against
    /// the responder's signed prekey, which also serves as the first remote
    /// ratchet key.
    pub(crate) fn new_initiator(
        local_identity_key: IdentityKey,
        remote_identity_key: IdentityKey,
        local_registration_id: u32,
        remote_registration_id: u32,
        x3dh: X3DHSession,
        their_signed_pre_key: X25519PublicKey,
        pending_pre_key: PendingPreKey,
    ) -> Result<Self, SessionError> {
        let sending_ratchet_key = KeyPair::generate();
        let (root_key, sending_chain_key) = x3dh
            .root_key
            .create_chain(&their_signed_pre_key, &sending_ratchet_key)?;

        let mut receiver_chains = VecDeque::new();
        receiver_chains.push_back(ReceiverChain {
            ratchet_key: their_signed_pre_key,
            chain_key: x3dh.chain_key.clone(),
        });

        Ok(Self {
            session_version: CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            local_identity_key,
            remote_identity_key,
            local_registration_id,
            remote_registration_id,
            root_key,
            sender_chain: SenderChain {
                ratchet_key_pair: sending_ratchet_key,
                chain_key: sending_chain_key,
            },
            receiver_chains,
            remote_ratchet_key: Some(their_signed_pre_key),
            previous_counter: 0,
            pending_pre_key: Some(pending_pre_key),
            base_key: x3dh.base_key,
            skipped_keys: SkippedKeyCache::new(),
        })
    }

    /// Responder side. Sends on the signed prekey until the first DH step.
    pub(crate) fn new_responder(
        local_identity_key: IdentityKey,
        remote_identity_key: IdentityKey,
        local_registration_id: u32,
        remote_registration_id: u32,
        x3dh: X3DHSession,
        our_signed_pre_key: KeyPair,
    ) -> Self {
        Self {
            session_version: CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            local_identity_key,
            remote_identity_key,
            local_registration_id,
            remote_registration_id,
            root_key: x3dh.root_key.clone(),
            sender_chain: SenderChain {
                ratchet_key_pair: our_signed_pre_key,
                chain_key: x3dh.chain_key.clone(),
            },
            receiver_chains: VecDeque::new(),
            remote_ratchet_key: None,
            previous_counter: 0,
            pending_pre_key: None,
            base_key: x3dh.base_key,
            skipped_keys: SkippedKeyCache::new(),
        }
    }

    pub fn session_version(&self) -> u8 {
        self.session_version
    }

    pub fn local_identity_key(&self) -> &IdentityKey {
        &self.local_identity_key
    }

    pub fn remote_identity_key(&self) -> &IdentityKey {
        &self.remote_identity_key
    }

    pub fn local_registration_id(&self) -> u32 {
        self.local_registration_id
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn base_key(&self) -> &X25519PublicKey {
        &self.base_key
    }

    pub fn pending_pre_key(&self) -> Option<&PendingPreKey> {
        self.pending_pre_key.as_ref()
    }

    pub(crate) fn clear_pending_pre_key(&mut self) {
        self.pending_pre_key = None;
    }

    /// Last remote ratchet key observed, if any
    pub fn remote_ratchet_key(&self) -> Option<&X25519PublicKey> {
        self.remote_ratchet_key.as_ref()
    }

    pub fn sender_ratchet_key(&self) -> X25519PublicKey {
        self.sender_chain.ratchet_key_pair.public_key()
    }

    pub fn sender_chain_counter(&self) -> u32 {
        self.sender_chain.chain_key.counter()
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn has_receiver_chain(&self, ratchet_key: &X25519PublicKey) -> bool {
        self.receiver_chain_index(ratchet_key).is_some()
    }

    pub fn receiver_chain_counter(&self, ratchet_key: &X25519PublicKey) -> Option<u32> {
        self.receiver_chain_index(ratchet_key)
            .map(|index| self.receiver_chains[index].chain_key.counter())
    }

    pub fn receiver_chain_count(&self) -> usize {
        self.receiver_chains.len()
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys.len()
    }

    /// Message keys for the next outgoing message; advances the sending chain
    pub(crate) fn ratchet_sending(&mut self) -> Result<MessageKeys, SessionError> {
        let keys = self.sender_chain.chain_key.message_keys()?;
        self.sender_chain.chain_key = self.sender_chain.chain_key.next_chain_key()?;
        Ok(keys)
    }

    /// Message keys for an incoming header, running the DH ratchet first if
    /// the ratchet key is new.
    pub(crate) fn ratchet_receiving(
        &mut self,
        their_ratchet_key: &X25519PublicKey,
        counter: u32,
        previous_counter: u32,
        config: &ProtocolConfig,
    ) -> Result<MessageKeys, SessionError> {
        if !self.has_receiver_chain(their_ratchet_key) {
            self.dh_ratchet(their_ratchet_key, previous_counter, config)?;
        }

        let index = self
            .receiver_chain_index(their_ratchet_key)
            .ok_or_else(|| SessionError::InvalidMessage("missing receiver chain".into()))?;
        let current = self.receiver_chains[index].chain_key.counter();

        if counter < current {
            return self
                .skipped_keys
                .take(their_ratchet_key, counter)
                .ok_or(SessionError::DuplicateMessage { counter });
        }

        let chain_key = self.skip_message_keys(index, counter, config)?;
        let keys = chain_key.message_keys()?;
        self.receiver_chains[index].chain_key = chain_key.next_chain_key()?;
        Ok(keys)
    }

    /// Cache keys for `[chain counter, until)` on receiver chain `index`,
    /// returning the chain key positioned at `until`.
    fn skip_message_keys(
        &mut self,
        index: usize,
        until: u32,
        config: &ProtocolConfig,
    ) -> Result<ChainKey, SessionError> {
        let ratchet_key = self.receiver_chains[index].ratchet_key;
        let mut chain_key = self.receiver_chains[index].chain_key.clone();
        let current = chain_key.counter();

        if until - current > config.max_forward_jumps {
            return Err(SessionError::MessageCounterTooLarge {
                counter: until,
                current,
            });
        }

        let mut evicted = 0;
        while chain_key.counter() < until {
            evicted += self.skipped_keys.insert(
                ratchet_key,
                chain_key.message_keys()?,
                config.max_message_keys,
            );
            chain_key = chain_key.next_chain_key()?;
        }

        if until > current {
            debug!(skipped = until - current, evicted, "Cached skipped message keys");
        }
        Ok(chain_key)
    }

    fn dh_ratchet(
        &mut self,
        their_ratchet_key: &X25519PublicKey,
        previous_counter: u32,
        config: &ProtocolConfig,
    ) -> Result<(), SessionError> {
        // Keep keys for messages still in flight on the superseded chain
        if let Some(index) = self
            .remote_ratchet_key
            .and_then(|old| self.receiver_chain_index(&old))
        {
            if previous_counter > self.receiver_chains[index].chain_key.counter() {
                let chain_key = self.skip_message_keys(index, previous_counter, config)?;
                self.receiver_chains[index].chain_key = chain_key;
            }
        }

        let (root_key, receiver_chain_key) = self
            .root_key
            .create_chain(their_ratchet_key, &self.sender_chain.ratchet_key_pair)?;

        let ratchet_key_pair = KeyPair::generate();
        let (root_key, sender_chain_key) =
            root_key.create_chain(their_ratchet_key, &ratchet_key_pair)?;

        self.previous_counter = self.sender_chain.chain_key.counter();
        self.root_key = root_key;
        self.add_receiver_chain(*their_ratchet_key, receiver_chain_key, config);
        self.sender_chain = SenderChain {
            ratchet_key_pair,
            chain_key: sender_chain_key,
        };
        self.remote_ratchet_key = Some(*their_ratchet_key);

        debug!(
            previous_counter = self.previous_counter,
            receiver_chains = self.receiver_chains.len(),
            "DH ratchet step"
        );
        Ok(())
    }

    fn add_receiver_chain(
        &mut self,
        ratchet_key: X25519PublicKey,
        chain_key: ChainKey,
        config: &ProtocolConfig,
    ) {
        self.receiver_chains.push_back(ReceiverChain {
            ratchet_key,
            chain_key,
        });

        while self.receiver_chains.len() > config.max_receiver_chains.max(1) {
            if let Some(dropped) = self.receiver_chains.pop_front() {
                let purged = self.skipped_keys.remove_chain(&dropped.ratchet_key);
                debug!(purged, "Dropped oldest receiver chain");
            }
        }
    }

    fn receiver_chain_index(&self, ratchet_key: &X25519PublicKey) -> Option<usize> {
        self.receiver_chains
            .iter()
            .position(|chain| chain.ratchet_key == *ratchet_key)
    }
}
