//! Skipped message key cache
//!
//! Keys derived ahead of receipt, indexed by `(ratchet key, counter)` and
//! kept in insertion order so the oldest entry is evicted first.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::ratchet::MessageKeys;

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    #[serde(with = "crate::util::serde_hex::x25519")]
    ratchet_key: X25519PublicKey,
    keys: MessageKeys,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SkippedKeyCache {
    entries: VecDeque<SkippedKey>,
}

impl SkippedKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert keys for a skipped counter, evicting the oldest past `capacity`.
    /// Returns the number of evicted entries.
    pub fn insert(&mut self, ratchet_key: X25519PublicKey, keys: MessageKeys, capacity: usize) -> usize {
        if capacity == 0 {
            return 1;
        }

        let mut evicted = 0;
        while self.entries.len() >= capacity {
            self.entries.pop_front();
            evicted += 1;
        }
        self.entries.push_back(SkippedKey { ratchet_key, keys });
        evicted
    }

    pub fn contains(&self, ratchet_key: &X25519PublicKey, counter: u32) -> bool {
        self.position(ratchet_key, counter).is_some()
    }

    /// Remove and return the keys for `(ratchet_key, counter)`
    pub fn take(&mut self, ratchet_key: &X25519PublicKey, counter: u32) -> Option<MessageKeys> {
        let index = self.position(ratchet_key, counter)?;
        self.entries.remove(index).map(|entry| entry.keys)
    }

    /// Drop every key derived from a retired receiving chain
    pub fn remove_chain(&mut self, ratchet_key: &X25519PublicKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.ratchet_key != *ratchet_key);
        before - self.entries.len()
    }

    fn position(&self, ratchet_key: &X25519PublicKey, counter: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.ratchet_key == *ratchet_key && entry.keys.counter() == counter)
    }
}
