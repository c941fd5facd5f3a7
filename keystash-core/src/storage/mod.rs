//! Persistence boundary: whole-record get/set/remove over JSON values.
//!
//! The engine never locks or versions records beyond whole-record replace.
//! Callers serialize writers to the same key.

pub mod companion;
pub mod schema;
pub mod sqlite;
pub mod wallet_store;

pub use companion::{
    Contact, EncryptedRecords, RecordStore, TxMetadata, CONTACTS_KEY, TX_METADATA_KEY,
};
pub use schema::{
    ImportedKey, KeyType, PendingMultisigTx, StoredWallet, WalletRecordV1, WalletRecordV2,
    CURRENT_WALLET_VERSION, PREMIGRATION_KEY, WALLET_KEY,
};
pub use sqlite::SqliteStore;
pub use wallet_store::WalletStore;

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process store for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.write().remove(key);
        Ok(())
    }
}

/// Wraps [`MemoryStore`] and fails writes to one key once armed.
#[cfg(test)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    key: &'static str,
    armed: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn new(key: &'static str) -> Self {
        Self {
            inner: MemoryStore::new(),
            key,
            armed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn arm(&self) {
        self.armed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self, key: &str) -> Result<()> {
        if key == self.key && self.armed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::KeystashError::storage(format!("write to {} failed", key)));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.check(key)?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check(key)?;
        self.inner.remove(key).await
    }
}
