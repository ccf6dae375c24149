//! Secret store boundary.
//!
//! The credential provider only needs three operations on the vault: read an entry,
//! delete it, and add it back. `KeyringStore` maps them onto the platform keychain
//! (macOS Keychain, Windows Credential Manager, Linux kernel keyutils); `MemoryStore`
//! keeps entries in-process.

use std::collections::HashMap;
use std::sync::Mutex;

use keyring::Entry;
use tracing::{debug, warn};

use crate::error::StoreError;

pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when no entry exists for the key
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, StoreError>;

    /// Deleting a missing entry is not an error
    fn delete(&self, service: &str, account: &str) -> Result<(), StoreError>;

    fn add(&self, service: &str, account: &str, secret: &str) -> Result<(), StoreError>;
}

/// System keychain via the `keyring` crate
#[derive(Debug, Clone, Default)]
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(service: &str, account: &str) -> Result<Entry, StoreError> {
        Entry::new(service, account).map_err(StoreError::from)
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, StoreError> {
        let entry = Self::entry(service, account)?;

        match entry.get_password() {
            Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
            Ok(_) | Err(keyring::Error::NoEntry) => {
                debug!(service = %service, account = %account, "Credential not found");
                Ok(None)
            }
            Err(e) => {
                warn!(service = %service, account = %account, error = %e, "Failed to read credential");
                Err(e.into())
            }
        }
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), StoreError> {
        let entry = Self::entry(service, account)?;

        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                warn!(service = %service, account = %account, error = %e, "Failed to delete credential");
                Err(e.into())
            }
        }
    }

    fn add(&self, service: &str, account: &str, secret: &str) -> Result<(), StoreError> {
        let entry = Self::entry(service, account)?;

        entry.set_password(secret).map_err(|e| {
            warn!(service = %service, account = %account, error = %e, "Failed to store credential");
            StoreError::from(e)
        })
    }
}

/// In-process store for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(service: &str, account: &str, secret: &str) -> Self {
        let store = Self::new();
        store
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((service.to_string(), account.to_string()), secret.to_string());
        store
    }

    fn key(service: &str, account: &str) -> (String, String) {
        (service.to_string(), account.to_string())
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Platform(e.to_string()))?;
        Ok(entries.get(&Self::key(service, account)).cloned())
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Platform(e.to_string()))?;
        entries.remove(&Self::key(service, account));
        Ok(())
    }

    fn add(&self, service: &str, account: &str, secret: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Platform(e.to_string()))?;
        entries.insert(Self::key(service, account), secret.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    #[test]
    fn test_memory_store_delete_then_add() {
        let store = MemoryStore::with_entry("svc", "me", "old");
        assert!(store.get("svc", "me").unwrap().as_deref() == Some("old"));

        store.delete("svc", "me").unwrap();
        assert!(store.get("svc", "me").unwrap().is_none());
        // deleting twice is fine
        store.delete("svc", "me").unwrap();

        store.add("svc", "me", "new").unwrap();
        assert!(store.get("svc", "me").unwrap().as_deref() == Some("new"));
        assert!(store.get("svc", "someone-else").unwrap().is_none());
    }
}
