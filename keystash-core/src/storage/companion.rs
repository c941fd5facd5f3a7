//! Encrypted side records kept next to the wallet: contacts and
//! transaction metadata.
//!
//! Each record holds one salt and iteration count; every item is sealed
//! under the key derived from them with its own IV, so a listing runs the
//! KDF once no matter how many items exist.

use crate::crypto::blob::{encode, expect_len};
use crate::crypto::{derive_key, generate_salt, DerivedKey, EncryptedBlob, MIN_ITERATIONS, SALT_SIZE, WALLET_ITERATIONS};
use crate::error::{KeystashError, Result};
use crate::storage::KeyValueStore;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const CONTACTS_KEY: &str = "contacts";
pub const TX_METADATA_KEY: &str = "tx_metadata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMetadata {
    pub txid: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The persisted form of a record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecords {
    pub salt: String,
    pub iterations: u32,
    #[serde(default)]
    pub items: BTreeMap<String, EncryptedBlob>,
}

impl EncryptedRecords {
    fn fresh() -> Self {
        Self {
            salt: encode(&generate_salt()),
            iterations: WALLET_ITERATIONS,
            items: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        expect_len("salt", &self.salt, SALT_SIZE)?;
        if self.iterations < MIN_ITERATIONS {
            return Err(KeystashError::validation(format!(
                "Record store iteration count {} is below the minimum of {}",
                self.iterations, MIN_ITERATIONS
            )));
        }
        for (id, item) in &self.items {
            if id.is_empty() {
                return Err(KeystashError::validation("Record store item has an empty id"));
            }
            item.validate(false)
                .map_err(|e| KeystashError::validation(format!("Item '{}': {}", id, e)))?;
            if item.salt.is_some() || item.iterations.is_some() {
                return Err(KeystashError::validation(format!(
                    "Item '{}' must be sealed under the shared key",
                    id
                )));
            }
        }
        Ok(())
    }

    fn key(&self, password: &str) -> Result<DerivedKey> {
        let salt = expect_len("salt", &self.salt, SALT_SIZE)?;
        derive_key(password, &salt, self.iterations)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct RecordStore {
    store: Arc<dyn KeyValueStore>,
    key: &'static str,
}

impl RecordStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key: &'static str) -> Self {
        Self { store, key }
    }

    pub fn contacts(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, CONTACTS_KEY)
    }

    pub fn tx_metadata(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, TX_METADATA_KEY)
    }

    pub fn name(&self) -> &'static str {
        self.key
    }

    /// Decrypt every item. Items are opened concurrently and gathered
    /// before returning.
    pub async fn list<T: DeserializeOwned>(&self, password: &str) -> Result<BTreeMap<String, T>> {
        let records = match self.export_raw().await? {
            Some(records) => records,
            None => return Ok(BTreeMap::new()),
        };
        let key = records.key(password)?;

        let opened = try_join_all(records.items.iter().map(|(id, blob)| {
            let key = &key;
            async move {
                let plaintext = blob.open_with_key(key)?;
                let item: T = serde_json::from_slice(&plaintext)?;
                Ok::<_, KeystashError>((id.clone(), item))
            }
        }))
        .await?;

        debug!("Opened {} item(s) from {}", opened.len(), self.key);
        Ok(opened.into_iter().collect())
    }

    pub async fn get<T: DeserializeOwned>(&self, id: &str, password: &str) -> Result<Option<T>> {
        let records = match self.export_raw().await? {
            Some(records) => records,
            None => return Ok(None),
        };
        match records.items.get(id) {
            Some(blob) => {
                let key = records.key(password)?;
                let plaintext = blob.open_with_key(&key)?;
                Ok(Some(serde_json::from_slice(&plaintext)?))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace `id`. The password must open the existing items.
    pub async fn put<T: Serialize>(&self, id: &str, item: &T, password: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(KeystashError::validation("Record id cannot be empty"));
        }

        let mut records = self.export_raw().await?.unwrap_or_else(EncryptedRecords::fresh);
        let key = records.key(password)?;
        if let Some(existing) = records.items.values().next() {
            existing.open_with_key(&key)?;
        }

        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(item)?);
        records
            .items
            .insert(id.to_string(), EncryptedBlob::seal_with_key(&key, &plaintext)?);
        self.save(&records).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut records = match self.export_raw().await? {
            Some(records) => records,
            None => return Ok(false),
        };
        if records.items.remove(id).is_none() {
            return Ok(false);
        }
        self.save(&records).await?;
        Ok(true)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.export_raw().await?.map(|r| r.len()).unwrap_or(0))
    }

    /// Re-seal every item under `new_password` with a fresh salt, in one write.
    pub async fn rekey(&self, old_password: &str, new_password: &str) -> Result<usize> {
        let records = match self.export_raw().await? {
            Some(records) => records,
            None => return Ok(0),
        };

        let old_key = records.key(old_password)?;
        let mut rekeyed = EncryptedRecords::fresh();
        let new_key = rekeyed.key(new_password)?;
        for (id, blob) in &records.items {
            let plaintext = blob.open_with_key(&old_key)?;
            rekeyed
                .items
                .insert(id.clone(), EncryptedBlob::seal_with_key(&new_key, &plaintext)?);
        }

        let count = rekeyed.len();
        self.save(&rekeyed).await?;
        info!("Re-keyed {} item(s) in {}", count, self.key);
        Ok(count)
    }

    /// The encrypted form as stored, for backups.
    pub async fn export_raw(&self) -> Result<Option<EncryptedRecords>> {
        match self.store.get(self.key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| {
                KeystashError::validation(format!("Malformed {} record: {}", self.key, e))
            })?)),
            None => Ok(None),
        }
    }

    /// Replace the stored form wholesale. Returns the number of items restored.
    pub async fn restore_raw(&self, records: &EncryptedRecords) -> Result<usize> {
        self.save(records).await?;
        Ok(records.len())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(self.key).await
    }

    async fn save(&self, records: &EncryptedRecords) -> Result<()> {
        records.validate()?;
        self.store.set(self.key, serde_json::to_value(records)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const PASSWORD: &str = "correct horse battery";

    fn contact(name: &str) -> Contact {
        Contact {
            name: name.to_string(),
            address: "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl".to_string(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_put_and_list() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let contacts = RecordStore::contacts(store.clone());

        assert!(contacts.list::<Contact>(PASSWORD).await.unwrap().is_empty());

        contacts.put("alice", &contact("Alice"), PASSWORD).await.unwrap();
        contacts.put("bob", &contact("Bob"), PASSWORD).await.unwrap();

        let listed: BTreeMap<String, Contact> = contacts.list(PASSWORD).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed["alice"], contact("Alice"));
        assert_eq!(
            contacts.get::<Contact>("bob", PASSWORD).await.unwrap(),
            Some(contact("Bob"))
        );

        let raw = contacts.export_raw().await.unwrap().unwrap();
        let ivs: std::collections::HashSet<_> = raw.items.values().map(|b| b.iv.clone()).collect();
        assert_eq!(ivs.len(), 2);
        assert!(raw.items.values().all(|b| b.salt.is_none()));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let contacts = RecordStore::contacts(store);
        contacts.put("alice", &contact("Alice"), PASSWORD).await.unwrap();

        let err = contacts.list::<Contact>("wrong password").await.unwrap_err();
        assert!(err.is_decryption_failure());
        assert!(contacts
            .put("mallory", &contact("Mallory"), "wrong password")
            .await
            .is_err());
        assert_eq!(contacts.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rekey_and_restore() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let metadata = RecordStore::tx_metadata(store.clone());
        let label = TxMetadata {
            txid: "ab".repeat(32),
            label: "Rent".to_string(),
            notes: Some("March".to_string()),
        };
        metadata.put(&label.txid, &label, PASSWORD).await.unwrap();

        let before = metadata.export_raw().await.unwrap().unwrap();
        assert_eq!(metadata.rekey(PASSWORD, "new password 123").await.unwrap(), 1);
        let after = metadata.export_raw().await.unwrap().unwrap();
        assert_ne!(before.salt, after.salt);

        let listed: BTreeMap<String, TxMetadata> = metadata.list("new password 123").await.unwrap();
        assert_eq!(listed[&label.txid], label);

        metadata.clear().await.unwrap();
        assert_eq!(metadata.restore_raw(&before).await.unwrap(), 1);
        let listed: BTreeMap<String, TxMetadata> = metadata.list(PASSWORD).await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(metadata.remove(&label.txid).await.unwrap());
        assert!(!metadata.remove(&label.txid).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_rejects_malformed() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let contacts = RecordStore::contacts(store);
        let bad = EncryptedRecords {
            salt: encode(&[0u8; 8]),
            iterations: WALLET_ITERATIONS,
            items: BTreeMap::new(),
        };
        assert!(contacts.restore_raw(&bad).await.is_err());
        assert_eq!(contacts.count().await.unwrap(), 0);
    }
}
