//! Flat state changes accompanying a node set.
//!
//! The state set records, for every account and storage slot touched by a
//! transition, the value it held *before* the transition. The path scheme
//! stores it inside each state history so a rollback knows what to restore.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::Hash;

/// Original values of the accounts and storage slots mutated by one state
/// transition. An empty value means the entry did not exist before.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSet {
    /// Account hash → original encoded account.
    pub accounts: HashMap<Hash, Vec<u8>>,
    /// Account hash → slot hash → original slot value.
    pub storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    /// Accounts whose storage was too large to record in full. A history
    /// containing any of them cannot be used for rollback.
    pub incomplete: HashSet<Hash>,
}

impl StateSet {
    /// An empty state set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the original value of an account.
    pub fn set_account(&mut self, account: Hash, original: Vec<u8>) {
        self.accounts.insert(account, original);
    }

    /// Record the original value of a storage slot.
    pub fn set_storage(&mut self, account: Hash, slot: Hash, original: Vec<u8>) {
        self.storages
            .entry(account)
            .or_default()
            .insert(slot, original);
    }

    /// Flag an account's storage as only partially recorded.
    pub fn mark_incomplete(&mut self, account: Hash) {
        self.incomplete.insert(account);
    }

    /// Whether every touched storage was recorded in full.
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }

    /// Whether no change was recorded at all.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storages.is_empty() && self.incomplete.is_empty()
    }

    /// Approximate memory footprint in bytes.
    pub fn size(&self) -> u64 {
        let accounts: usize = self.accounts.values().map(|v| 32 + v.len()).sum();
        let storages: usize = self
            .storages
            .values()
            .flat_map(|slots| slots.values())
            .map(|v| 64 + v.len())
            .sum();
        (accounts + storages + 32 * self.incomplete.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_storage_marks_set_incomplete() {
        let mut states = StateSet::new();
        states.set_storage([1u8; 32], [2u8; 32], vec![3]);
        assert!(states.is_complete());

        states.mark_incomplete([1u8; 32]);
        assert!(!states.is_complete());
    }

    #[test]
    fn size_counts_keys_and_values() {
        let mut states = StateSet::new();
        assert!(states.is_empty());
        states.set_account([1u8; 32], vec![0; 10]);
        states.set_storage([1u8; 32], [2u8; 32], vec![0; 4]);
        assert_eq!(states.size(), 42 + 68);
    }
}
