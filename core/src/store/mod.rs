//! Store contracts consumed by the session engine
//!
//! Storage itself is external: implementations only need atomic get/put per
//! key. `InMemProtocolStore` is the reference implementation used in tests.

mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OwnedMutexGuard};

use crate::address::ProtocolAddress;
use crate::config::ProtocolConfig;
use crate::crypto::keys::{IdentityKey, IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord};
use crate::session::{SessionError, SessionRecord};

pub use memory::InMemProtocolStore;

/// Which way a message is flowing when an identity is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

#[async_trait]
pub trait IdentityKeyStore: Send + Sync {
    async fn identity_key_pair(&self) -> Result<IdentityKeyPair, SessionError>;

    async fn local_registration_id(&self) -> Result<u32, SessionError>;

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, SessionError>;

    /// Record the identity seen for `address`. Returns true if it replaced a
    /// different key.
    async fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SessionError>;

    async fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, SessionError>;
}

#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, SessionError>;

    async fn store_pre_key(&self, record: PreKeyRecord) -> Result<(), SessionError>;

    async fn remove_pre_key(&self, id: u32) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, SessionError>;

    async fn store_signed_pre_key(&self, record: SignedPreKeyRecord) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>, SessionError>;

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SessionError>;

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<(), SessionError>;

    /// Device ids with a stored session for `name`
    async fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>, SessionError>;
}

/// Everything the builder and cipher need from storage
pub trait ProtocolStore: IdentityKeyStore + PreKeyStore + SignedPreKeyStore + SessionStore {}

impl<T> ProtocolStore for T where T: IdentityKeyStore + PreKeyStore + SignedPreKeyStore + SessionStore {}

/// Per-address serialization of session mutations
///
/// Each encrypt/decrypt is a read-modify-write of the session record, so at
/// most one may be in flight per address. Different addresses never contend.
#[derive(Default)]
pub struct AddressLocks {
    sessions: Mutex<HashMap<ProtocolAddress, Arc<AsyncMutex<()>>>>,
    pre_keys: AsyncMutex<()>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, address: &ProtocolAddress) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody holds or waits on can go
            sessions.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            sessions.entry(address.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Serializes one-time prekey consumption across all addresses. Only
    /// held while a prekey is looked up, used and removed.
    pub async fn lock_pre_keys(&self) -> AsyncMutexGuard<'_, ()> {
        self.pre_keys.lock().await
    }

    pub fn tracked_addresses(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_else(|e| e.into_inner().len())
    }
}

/// Store handle, limits and locks shared by builders and ciphers
pub struct ProtocolContext<S> {
    pub store: S,
    pub config: ProtocolConfig,
    pub locks: AddressLocks,
}

impl<S: ProtocolStore> ProtocolContext<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, ProtocolConfig::default())
    }

    pub fn with_config(store: S, config: ProtocolConfig) -> Self {
        Self {
            store,
            config,
            locks: AddressLocks::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_address_is_serialized() {
        let locks = Arc::new(AddressLocks::new());
        let address = ProtocolAddress::new("bob", 1);

        let guard = locks.lock(&address).await;
        let waiter = {
            let locks = locks.clone();
            let address = address.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&address).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_addresses_do_not_contend() {
        let locks = AddressLocks::new();
        let _bob = locks.lock(&ProtocolAddress::new("bob", 1)).await;
        let _carol = locks.lock(&ProtocolAddress::new("carol", 1)).await;
        assert_eq!(locks.tracked_addresses(), 2);
    }

    #[tokio::test]
    async fn test_idle_entries_pruned() {
        let locks = AddressLocks::new();
        drop(locks.lock(&ProtocolAddress::new("bob", 1)).await);
        let _carol = locks.lock(&ProtocolAddress::new("carol", 1)).await;
        assert_eq!(locks.tracked_addresses(), 1);
    }
}
