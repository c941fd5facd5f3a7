use crate::crypto::{EncryptedBlob, SecretString};
use crate::error::{KeystashError, Result};
use crate::keys::{normalize_mnemonic, parse_mnemonic};
use crate::storage::schema::{
    ImportedKey, KeyType, PendingMultisigTx, StoredWallet, WalletRecordV2, PREMIGRATION_KEY,
    WALLET_KEY,
};
use crate::storage::KeyValueStore;
use crate::types::{ImportType, WalletAccount};
use crate::wallet::WalletSettings;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Read-modify-write access to the single wallet record.
///
/// The seed stays encrypted in every value this returns except
/// [`unlock`](Self::unlock). Nothing is cached between calls.
pub struct WalletStore<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> WalletStore<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    pub async fn has_wallet(&self) -> Result<bool> {
        Ok(self.store.get(WALLET_KEY).await?.is_some())
    }

    /// Persist a new wallet sealing `mnemonic` under `password`.
    pub async fn create_wallet(
        &self,
        mnemonic: &str,
        password: &str,
        settings: WalletSettings,
        accounts: Vec<WalletAccount>,
    ) -> Result<WalletRecordV2> {
        if self.has_wallet().await? {
            return Err(KeystashError::WalletExists);
        }
        check_password(password)?;
        parse_mnemonic(mnemonic)?;

        let phrase = normalize_mnemonic(mnemonic);
        let mut record = WalletRecordV2::new(EncryptedBlob::seal(phrase.as_bytes(), password)?, settings);
        record.accounts = accounts;

        let stored = StoredWallet::V2(record);
        self.write(&stored).await?;

        info!(
            "Created wallet on {} with {} account(s)",
            stored.network(),
            stored.accounts().len()
        );
        stored.into_current()
    }

    pub async fn get_wallet(&self) -> Result<StoredWallet> {
        let value = self.get_raw().await?.ok_or(KeystashError::WalletNotFound)?;
        StoredWallet::from_value(value)
    }

    /// The current-version record; v1 records must be migrated first.
    pub async fn get_current(&self) -> Result<WalletRecordV2> {
        self.get_wallet().await?.into_current()
    }

    /// Decrypt the seed phrase. Wrong passwords and damaged records fail alike.
    pub async fn unlock(&self, password: &str) -> Result<SecretString> {
        let wallet = self.get_wallet().await?;
        open_text(wallet.encrypted_seed(), password)
    }

    /// `Ok(false)` for a wrong password; storage failures still propagate.
    pub async fn verify_password(&self, password: &str) -> Result<bool> {
        match self.unlock(password).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_decryption_failure() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn update_accounts(&self, accounts: Vec<WalletAccount>) -> Result<()> {
        let mut record = self.get_current().await?;
        record.accounts = accounts;
        self.write_current(record).await
    }

    pub async fn add_account(&self, account: WalletAccount) -> Result<()> {
        let mut record = self.get_current().await?;
        ensure_free_index(&record, account.index())?;

        let (index, name) = (account.index(), account.name().to_string());
        record.accounts.push(account);
        self.write_current(record).await?;

        info!("Added account {} '{}'", index, name);
        Ok(())
    }

    pub async fn update_account(&self, account: WalletAccount) -> Result<()> {
        let mut record = self.get_current().await?;
        let index = account.index();
        *record.account_mut(index)? = account;
        self.write_current(record).await
    }

    /// Add an imported account and its sealed key in one write.
    pub async fn add_account_with_key(
        &self,
        account: WalletAccount,
        secret: &str,
        key_type: KeyType,
        password: &str,
    ) -> Result<()> {
        let mut record = self.get_current().await?;
        open_text(&record.encrypted_seed, password)?;
        ensure_free_index(&record, account.index())?;
        ensure_imported(&account)?;

        let index = account.index();
        record.accounts.push(account);
        record.imported_keys.insert(
            index,
            ImportedKey {
                blob: EncryptedBlob::seal(secret.as_bytes(), password)?,
                key_type,
            },
        );
        self.write_current(record).await?;

        info!("Added imported account {}", index);
        Ok(())
    }

    /// Seal `secret` for an existing imported account under the wallet password.
    pub async fn store_imported_key(
        &self,
        account_index: u32,
        secret: &str,
        key_type: KeyType,
        password: &str,
    ) -> Result<()> {
        let mut record = self.get_current().await?;
        open_text(&record.encrypted_seed, password)?;
        ensure_imported(record.account(account_index)?)?;

        record.imported_keys.insert(
            account_index,
            ImportedKey {
                blob: EncryptedBlob::seal(secret.as_bytes(), password)?,
                key_type,
            },
        );
        self.write_current(record).await?;

        info!("Stored imported key for account {}", account_index);
        Ok(())
    }

    pub async fn unlock_imported_key(&self, account_index: u32, password: &str) -> Result<(KeyType, SecretString)> {
        let record = self.get_current().await?;
        let key = record
            .imported_keys
            .get(&account_index)
            .ok_or(KeystashError::AccountNotFound { index: account_index })?;
        Ok((key.key_type, open_text(&key.blob, password)?))
    }

    /// Returns whether a key was removed. The account stays, watch-only.
    pub async fn delete_imported_key(&self, account_index: u32) -> Result<bool> {
        let mut record = self.get_current().await?;
        if record.imported_keys.remove(&account_index).is_none() {
            return Ok(false);
        }
        self.write_current(record).await?;

        info!("Deleted imported key for account {}", account_index);
        Ok(true)
    }

    /// Re-seal the seed and every imported key under `new_password` in one write.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        check_password(new_password)?;
        let mut record = self.get_current().await?;

        let phrase = open_text(&record.encrypted_seed, old_password)?;
        record.encrypted_seed = EncryptedBlob::seal(phrase.as_bytes(), new_password)?;

        for (index, key) in record.imported_keys.iter_mut() {
            let secret = key.blob.open(old_password)?;
            key.blob = EncryptedBlob::seal(&secret, new_password)?;
            debug!("Re-sealed imported key for account {}", index);
        }

        self.write_current(record).await?;
        info!("Changed wallet password");
        Ok(())
    }

    pub async fn add_pending_multisig_tx(&self, tx: PendingMultisigTx) -> Result<()> {
        let mut record = self.get_current().await?;
        if record.pending_multisig_txs.iter().any(|p| p.id == tx.id) {
            return Err(KeystashError::duplicate(format!(
                "Pending transaction {} already exists",
                tx.id
            )));
        }

        let (id, account_index) = (tx.id, tx.account_index);
        record.pending_multisig_txs.push(tx);
        self.write_current(record).await?;

        info!("Saved pending multisig transaction {} for account {}", id, account_index);
        Ok(())
    }

    pub async fn remove_pending_multisig_tx(&self, id: Uuid) -> Result<bool> {
        let mut record = self.get_current().await?;
        let before = record.pending_multisig_txs.len();
        record.pending_multisig_txs.retain(|p| p.id != id);
        if record.pending_multisig_txs.len() == before {
            return Ok(false);
        }
        self.write_current(record).await?;
        Ok(true)
    }

    /// Upgrade a v1 record, keeping the untouched original under
    /// [`PREMIGRATION_KEY`]. Returns `false` if already current.
    pub async fn migrate(&self) -> Result<bool> {
        let raw = self.get_raw().await?.ok_or(KeystashError::WalletNotFound)?;
        let record = match StoredWallet::from_value(raw.clone())? {
            StoredWallet::V2(_) => return Ok(false),
            StoredWallet::V1(record) => record,
        };

        let upgraded = StoredWallet::V2(record.into_v2());
        upgraded.validate()?;

        self.store.set(PREMIGRATION_KEY, raw).await?;
        self.store.set(WALLET_KEY, upgraded.to_value()?).await?;

        info!("Migrated wallet record from version 1 to 2");
        Ok(true)
    }

    /// Put the pre-migration snapshot back and drop it.
    pub async fn rollback_migration(&self) -> Result<()> {
        let snapshot = self
            .store
            .get(PREMIGRATION_KEY)
            .await?
            .ok_or_else(|| KeystashError::validation("No pre-migration snapshot to roll back to"))?;
        StoredWallet::from_value(snapshot.clone())?;

        self.store.set(WALLET_KEY, snapshot).await?;
        self.store.remove(PREMIGRATION_KEY).await?;

        info!("Rolled back wallet record to its pre-migration snapshot");
        Ok(())
    }

    pub async fn has_migration_snapshot(&self) -> Result<bool> {
        Ok(self.store.get(PREMIGRATION_KEY).await?.is_some())
    }

    pub async fn delete_wallet(&self) -> Result<()> {
        self.store.remove(WALLET_KEY).await?;
        self.store.remove(PREMIGRATION_KEY).await?;
        info!("Deleted wallet record");
        Ok(())
    }

    /// Drop the pre-migration snapshot, if any.
    pub async fn clear_migration_snapshot(&self) -> Result<()> {
        self.store.remove(PREMIGRATION_KEY).await
    }

    /// Overwrite the record wholesale after validating it.
    pub async fn replace_wallet(&self, wallet: &StoredWallet) -> Result<()> {
        self.write(wallet).await
    }

    pub async fn get_raw(&self) -> Result<Option<Value>> {
        self.store.get(WALLET_KEY).await
    }

    /// Restore a raw snapshot taken with [`get_raw`](Self::get_raw).
    pub async fn put_raw(&self, value: Option<Value>) -> Result<()> {
        match value {
            Some(value) => self.store.set(WALLET_KEY, value).await,
            None => self.store.remove(WALLET_KEY).await,
        }
    }

    async fn write_current(&self, record: WalletRecordV2) -> Result<()> {
        self.write(&StoredWallet::V2(record)).await
    }

    async fn write(&self, wallet: &StoredWallet) -> Result<()> {
        wallet.validate()?;
        self.store.set(WALLET_KEY, wallet.to_value()?).await
    }
}

pub(crate) fn check_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(KeystashError::validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn open_text(blob: &EncryptedBlob, password: &str) -> Result<SecretString> {
    let bytes = blob.open(password)?;
    // Valid UTF-8 was sealed; anything else means the record was altered.
    let text = std::str::from_utf8(&bytes).map_err(|_| KeystashError::Integrity)?;
    Ok(Zeroizing::new(text.to_string()))
}

fn ensure_free_index(record: &WalletRecordV2, index: u32) -> Result<()> {
    if record.account(index).is_ok() {
        return Err(KeystashError::duplicate(format!(
            "Account index {} is already in use",
            index
        )));
    }
    Ok(())
}

fn ensure_imported(account: &WalletAccount) -> Result<()> {
    if account.import_type() == ImportType::Hd {
        return Err(KeystashError::validation(format!(
            "Account {} derives from the wallet seed and cannot hold an imported key",
            account.index()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::TEST_MNEMONIC;
    use crate::storage::schema::test_support::{account, wallet_v1};
    use crate::storage::MemoryStore;
    use crate::types::WalletNetwork;

    const PASSWORD: &str = "correct horse battery";

    async fn store_with_wallet(store: &MemoryStore) -> WalletStore<'_> {
        let wallet_store = WalletStore::new(store);
        wallet_store
            .create_wallet(
                TEST_MNEMONIC,
                PASSWORD,
                WalletSettings::new(WalletNetwork::Testnet),
                vec![WalletAccount::SingleSig(account(0, 2, 1))],
            )
            .await
            .unwrap();
        wallet_store
    }

    #[tokio::test]
    async fn test_create_and_unlock() {
        let store = MemoryStore::new();
        let wallet_store = store_with_wallet(&store).await;

        assert!(wallet_store.has_wallet().await.unwrap());
        assert_eq!(wallet_store.unlock(PASSWORD).await.unwrap().as_str(), TEST_MNEMONIC);
        assert!(wallet_store.verify_password(PASSWORD).await.unwrap());
        assert!(!wallet_store.verify_password("wrong password").await.unwrap());

        let err = wallet_store
            .create_wallet(TEST_MNEMONIC, PASSWORD, WalletSettings::default(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::WalletExists));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let store = MemoryStore::new();
        let wallet_store = WalletStore::new(&store);

        assert!(wallet_store
            .create_wallet("not a mnemonic", PASSWORD, WalletSettings::default(), Vec::new())
            .await
            .is_err());
        assert!(wallet_store
            .create_wallet(TEST_MNEMONIC, "short", WalletSettings::default(), Vec::new())
            .await
            .is_err());
        assert!(!wallet_store.has_wallet().await.unwrap());
    }

    #[tokio::test]
    async fn test_account_mutations() {
        let store = MemoryStore::new();
        let wallet_store = store_with_wallet(&store).await;

        let err = wallet_store
            .add_account(WalletAccount::SingleSig(account(0, 0, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::Duplicate(_)));

        wallet_store
            .add_account(WalletAccount::SingleSig(account(1, 0, 0)))
            .await
            .unwrap();

        let mut updated = account(1, 1, 0);
        updated.addresses[0].used = true;
        wallet_store
            .update_account(WalletAccount::SingleSig(updated.clone()))
            .await
            .unwrap();

        let record = wallet_store.get_current().await.unwrap();
        assert_eq!(record.accounts.len(), 2);
        assert_eq!(record.account(1).unwrap(), &WalletAccount::SingleSig(updated));

        let err = wallet_store
            .update_account(WalletAccount::SingleSig(account(7, 0, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::AccountNotFound { index: 7 }));
    }

    #[tokio::test]
    async fn test_malformed_write_not_persisted() {
        let store = MemoryStore::new();
        let wallet_store = store_with_wallet(&store).await;
        let before = wallet_store.get_raw().await.unwrap();

        let mut broken = account(0, 2, 1);
        broken.external_index = 9;
        assert!(wallet_store
            .update_accounts(vec![WalletAccount::SingleSig(broken)])
            .await
            .is_err());

        assert_eq!(wallet_store.get_raw().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_imported_keys_follow_password_change() {
        let store = MemoryStore::new();
        let wallet_store = store_with_wallet(&store).await;

        let mut imported = account(1, 1, 0);
        imported.import_type = ImportType::PrivateKey;
        let wif = "cTGhosGriPpuGA586jemcuH9pE9spwUmneMBmYYzrQEbY92DJrbo";

        assert!(wallet_store
            .add_account_with_key(
                WalletAccount::SingleSig(imported.clone()),
                wif,
                KeyType::PrivateKey,
                "not the password",
            )
            .await
            .is_err());
        wallet_store
            .add_account_with_key(WalletAccount::SingleSig(imported), wif, KeyType::PrivateKey, PASSWORD)
            .await
            .unwrap();

        wallet_store
            .change_password(PASSWORD, "a brand new password")
            .await
            .unwrap();

        assert!(!wallet_store.verify_password(PASSWORD).await.unwrap());
        let (key_type, secret) = wallet_store
            .unlock_imported_key(1, "a brand new password")
            .await
            .unwrap();
        assert_eq!(key_type, KeyType::PrivateKey);
        assert_eq!(secret.as_str(), wif);
        assert!(wallet_store.unlock_imported_key(1, PASSWORD).await.is_err());

        assert!(wallet_store.delete_imported_key(1).await.unwrap());
        assert!(!wallet_store.delete_imported_key(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_imported_key_needs_imported_account() {
        let store = MemoryStore::new();
        let wallet_store = store_with_wallet(&store).await;

        let err = wallet_store
            .store_imported_key(0, "secret", KeyType::Seed, PASSWORD)
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::Validation(_)));
    }

    #[tokio::test]
    async fn test_migration_and_rollback() {
        let store = MemoryStore::new();
        let wallet_store = WalletStore::new(&store);
        let v1 = StoredWallet::V1(wallet_v1());
        store.set(WALLET_KEY, v1.to_value().unwrap()).await.unwrap();
        let original = wallet_store.get_raw().await.unwrap();

        let err = wallet_store
            .add_account(WalletAccount::SingleSig(account(1, 0, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::MigrationRequired { version: 1 }));

        assert!(wallet_store.migrate().await.unwrap());
        assert!(wallet_store.has_migration_snapshot().await.unwrap());
        assert_eq!(wallet_store.get_wallet().await.unwrap().version(), 2);
        assert!(!wallet_store.migrate().await.unwrap());

        wallet_store
            .add_account(WalletAccount::SingleSig(account(1, 0, 0)))
            .await
            .unwrap();

        wallet_store.rollback_migration().await.unwrap();
        assert_eq!(wallet_store.get_raw().await.unwrap(), original);
        assert!(!wallet_store.has_migration_snapshot().await.unwrap());
        assert!(wallet_store.rollback_migration().await.is_err());
    }

    #[tokio::test]
    async fn test_pending_transactions() {
        let store = MemoryStore::new();
        let wallet_store = store_with_wallet(&store).await;

        let tx = PendingMultisigTx::new(0, "cHNidP8BAA==");
        assert!(wallet_store.add_pending_multisig_tx(tx.clone()).await.is_err());
        assert!(!wallet_store.remove_pending_multisig_tx(tx.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_wallet() {
        let store = MemoryStore::new();
        let wallet_store = store_with_wallet(&store).await;
        wallet_store.delete_wallet().await.unwrap();
        assert!(!wallet_store.has_wallet().await.unwrap());
        assert!(matches!(
            wallet_store.unlock(PASSWORD).await,
            Err(KeystashError::WalletNotFound)
        ));
    }
}
