//! In-memory protocol store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::warn;

use crate::address::ProtocolAddress;
use crate::crypto::keys::{IdentityKey, IdentityKeyPair, PreKeyBundle, PreKeyRecord, SignedPreKeyRecord};
use crate::session::{SessionError, SessionRecord};
use crate::store::{Direction, IdentityKeyStore, PreKeyStore, SessionStore, SignedPreKeyStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keys, identities and session blobs held in process memory.
///
/// Identities are trusted on first use: an address is trusted until a
/// different key has been saved for it.
pub struct InMemProtocolStore {
    identity: IdentityKeyPair,
    registration_id: u32,
    identities: Mutex<HashMap<ProtocolAddress, IdentityKey>>,
    pre_keys: Mutex<HashMap<u32, PreKeyRecord>>,
    signed_pre_keys: Mutex<HashMap<u32, SignedPreKeyRecord>>,
    /// Records are kept serialized, as a persistent store would
    sessions: Mutex<HashMap<ProtocolAddress, Vec<u8>>>,
}

impl InMemProtocolStore {
    pub fn new(identity: IdentityKeyPair, registration_id: u32) -> Self {
        Self {
            identity,
            registration_id,
            identities: Mutex::new(HashMap::new()),
            pre_keys: Mutex::new(HashMap::new()),
            signed_pre_keys: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh identity with the given registration id
    pub fn generate(registration_id: u32) -> Self {
        Self::new(IdentityKeyPair::generate(), registration_id)
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// Generate and store `count` one-time prekeys with consecutive ids
    pub fn generate_pre_keys(&self, start_id: u32, count: u32) -> Vec<PreKeyRecord> {
        let records: Vec<_> = (0..count)
            .map(|offset| PreKeyRecord::generate(start_id.wrapping_add(offset)))
            .collect();

        let mut pre_keys = lock(&self.pre_keys);
        for record in &records {
            pre_keys.insert(record.id(), record.clone());
        }
        records
    }

    pub fn generate_signed_pre_key(&self, id: u32) -> SignedPreKeyRecord {
        let record = SignedPreKeyRecord::generate(id, &self.identity);
        lock(&self.signed_pre_keys).insert(id, record.clone());
        record
    }

    pub fn pre_key_count(&self) -> usize {
        lock(&self.pre_keys).len()
    }

    /// Bundle to publish for `device_id`
    pub fn pre_key_bundle(
        &self,
        device_id: u32,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
    ) -> Result<PreKeyBundle, SessionError> {
        let signed = lock(&self.signed_pre_keys)
            .get(&signed_pre_key_id)
            .cloned()
            .ok_or(SessionError::StaleKey(signed_pre_key_id))?;

        let pre_key = match pre_key_id {
            Some(id) => Some(
                lock(&self.pre_keys)
                    .get(&id)
                    .cloned()
                    .ok_or(SessionError::MissingPreKey(id))?,
            ),
            None => None,
        };

        Ok(PreKeyBundle::new(
            self.registration_id,
            device_id,
            &self.identity,
            &signed,
            pre_key.as_ref(),
        ))
    }
}

#[async_trait]
impl IdentityKeyStore for InMemProtocolStore {
    async fn identity_key_pair(&self) -> Result<IdentityKeyPair, SessionError> {
        Ok(self.identity.clone())
    }

    async fn local_registration_id(&self) -> Result<u32, SessionError> {
        Ok(self.registration_id)
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, SessionError> {
        let trusted = match lock(&self.identities).get(address) {
            Some(known) => known == identity,
            None => true,
        };
        if !trusted {
            warn!(%address, ?direction, "Identity key changed");
        }
        Ok(trusted)
    }

    async fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SessionError> {
        let previous = lock(&self.identities).insert(address.clone(), *identity);
        Ok(previous.is_some_and(|known| known != *identity))
    }

    async fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, SessionError> {
        Ok(lock(&self.identities).get(address).copied())
    }
}

#[async_trait]
impl PreKeyStore for InMemProtocolStore {
    async fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, SessionError> {
        Ok(lock(&self.pre_keys).get(&id).cloned())
    }

    async fn store_pre_key(&self, record: PreKeyRecord) -> Result<(), SessionError> {
        lock(&self.pre_keys).insert(record.id(), record);
        Ok(())
    }

    async fn remove_pre_key(&self, id: u32) -> Result<(), SessionError> {
        lock(&self.pre_keys).remove(&id);
        Ok(())
    }
}

#[async_trait]
impl SignedPreKeyStore for InMemProtocolStore {
    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, SessionError> {
        Ok(lock(&self.signed_pre_keys).get(&id).cloned())
    }

    async fn store_signed_pre_key(&self, record: SignedPreKeyRecord) -> Result<(), SessionError> {
        lock(&self.signed_pre_keys).insert(record.id(), record);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemProtocolStore {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>, SessionError> {
        let blob = lock(&self.sessions).get(address).cloned();
        blob.map(|bytes| SessionRecord::deserialize(&bytes)).transpose()
    }

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SessionError> {
        let bytes = record.serialize()?;
        lock(&self.sessions).insert(address.clone(), bytes);
        Ok(())
    }

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<(), SessionError> {
        lock(&self.sessions).remove(address);
        Ok(())
    }

    async fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>, SessionError> {
        let mut devices: Vec<u32> = lock(&self.sessions)
            .keys()
            .filter(|address| address.name() == name)
            .map(ProtocolAddress::device_id)
            .collect();
        devices.sort_unstable();
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trust_on_first_use() {
        let store = InMemProtocolStore::generate(1002);
        let address = ProtocolAddress::new("alice", 1);
        let alice = IdentityKeyPair::generate().identity_key();
        let mallory = IdentityKeyPair::generate().identity_key();

        assert!(store.is_trusted_identity(&address, &alice, Direction::Receiving).await.unwrap());
        assert!(!store.save_identity(&address, &alice).await.unwrap());
        assert!(store.is_trusted_identity(&address, &alice, Direction::Sending).await.unwrap());
        assert!(!store.is_trusted_identity(&address, &mallory, Direction::Sending).await.unwrap());

        assert!(store.save_identity(&address, &mallory).await.unwrap());
        assert_eq!(store.get_identity(&address).await.unwrap(), Some(mallory));
    }

    #[tokio::test]
    async fn test_pre_key_lifecycle() {
        let store = InMemProtocolStore::generate(1002);
        let records = store.generate_pre_keys(2001, 3);
        assert_eq!(records[2].id(), 2003);
        assert_eq!(store.pre_key_count(), 3);

        store.remove_pre_key(2001).await.unwrap();
        assert!(store.load_pre_key(2001).await.unwrap().is_none());
        assert!(store.load_pre_key(2002).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pre_key_bundle() {
        let store = InMemProtocolStore::generate(1002);
        store.generate_pre_keys(2001, 1);
        store.generate_signed_pre_key(3001);

        let bundle = store.pre_key_bundle(1, Some(2001), 3001).unwrap();
        assert!(bundle.verify());
        assert_eq!(bundle.registration_id, 1002);
        assert_eq!(bundle.pre_key.map(|k| k.id), Some(2001));

        assert_eq!(
            store.pre_key_bundle(1, Some(9), 3001).err(),
            Some(SessionError::MissingPreKey(9))
        );
        assert_eq!(
            store.pre_key_bundle(1, None, 9).err(),
            Some(SessionError::StaleKey(9))
        );
    }

    #[tokio::test]
    async fn test_session_delete_and_devices() {
        let store = InMemProtocolStore::generate(1002);
        let record = SessionRecord::default();
        for address in [
            ProtocolAddress::new("alice", 2),
            ProtocolAddress::new("alice", 1),
            ProtocolAddress::new("carol", 1),
        ] {
            store.store_session(&address, &record).await.unwrap();
        }

        assert_eq!(store.sub_device_sessions("alice").await.unwrap(), vec![1, 2]);

        store.delete_session(&ProtocolAddress::new("alice", 1)).await.unwrap();
        assert_eq!(store.sub_device_sessions("alice").await.unwrap(), vec![2]);
        assert!(store
            .load_session(&ProtocolAddress::new("alice", 1))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.sub_device_sessions("carol").await.unwrap(), vec![1]);
    }
}
