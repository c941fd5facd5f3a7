use crate::backup::BackupManager;
use crate::crypto::SecretString;
use crate::error::{KeystashError, Result};
use crate::keys::{
    decode_wif, derive_account_node, export_xpub, generate_mnemonic, mnemonic_to_seed,
    new_master_key, normalize_mnemonic, parse_mnemonic, single_sig_address, KeyNode,
};
use crate::multisig::{create_multisig_account, derive_multisig_xpub, CosignerInput, LocalCosigner};
use crate::storage::wallet_store::check_password;
use crate::storage::{
    KeyType, KeyValueStore, PendingMultisigTx, RecordStore, SqliteStore, StoredWallet,
    WalletRecordV2, WalletStore,
};
use crate::types::{
    Account, AddressRecord, AddressType, Branch, ImportType, MultisigAccount,
    MultisigAddressType, MultisigConfig, WalletAccount, WalletNetwork,
};
use crate::wallet::account::{
    derivation_account, mark_used, new_account, next_multisig_address, next_single_sig_address,
    DEFAULT_ACCOUNT_NAME,
};
use crate::wallet::WalletSettings;
use base64::{engine::general_purpose, Engine as _};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub const DATABASE_FILE: &str = "keystash.db";

/// Words in a freshly generated recovery phrase.
pub const DEFAULT_ENTROPY_BITS: usize = 256;

/// Host-facing operations over one wallet record and its companion stores.
///
/// Every operation that needs key material takes the password and
/// re-derives from scratch; nothing secret outlives the call.
pub struct WalletManager {
    store: Arc<dyn KeyValueStore>,
}

impl WalletManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Open the SQLite database under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join(DATABASE_FILE);
        let store = Arc::new(SqliteStore::new(&db_path).await?);
        Ok(Self::new(store))
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    fn wallets(&self) -> WalletStore<'_> {
        WalletStore::new(self.store.as_ref())
    }

    pub fn backups(&self) -> BackupManager {
        BackupManager::new(self.store.clone())
    }

    pub fn contacts(&self) -> RecordStore {
        RecordStore::contacts(self.store.clone())
    }

    pub fn tx_metadata(&self) -> RecordStore {
        RecordStore::tx_metadata(self.store.clone())
    }

    pub async fn has_wallet(&self) -> Result<bool> {
        self.wallets().has_wallet().await
    }

    /// The stored record; the seed stays encrypted.
    pub async fn wallet(&self) -> Result<StoredWallet> {
        self.wallets().get_wallet().await
    }

    /// Generate a new recovery phrase and persist a wallet for it. The
    /// phrase is returned once for the user to write down.
    pub async fn create_wallet(
        &self,
        password: &str,
        network: WalletNetwork,
    ) -> Result<(WalletRecordV2, SecretString)> {
        // Check if wallet already exists
        if self.has_wallet().await? {
            return Err(KeystashError::WalletExists);
        }

        let mnemonic = generate_mnemonic(DEFAULT_ENTROPY_BITS)?;
        let record = self.import_wallet(&mnemonic, password, network).await?;
        Ok((record, mnemonic))
    }

    /// Persist a wallet for an existing recovery phrase, with a native
    /// segwit account 0 and its first receive address.
    pub async fn import_wallet(
        &self,
        mnemonic: &str,
        password: &str,
        network: WalletNetwork,
    ) -> Result<WalletRecordV2> {
        let settings = WalletSettings::new(network);
        settings.validate()?;

        let master = master_from_phrase(mnemonic, network)?;
        let mut account = new_account(0, DEFAULT_ACCOUNT_NAME, AddressType::NativeSegwit, ImportType::Hd)?;
        next_single_sig_address(&mut account, &master, Branch::External)?;

        self.wallets()
            .create_wallet(
                mnemonic,
                password,
                settings,
                vec![WalletAccount::SingleSig(account)],
            )
            .await
    }

    pub async fn unlock(&self, password: &str) -> Result<SecretString> {
        self.wallets().unlock(password).await
    }

    pub async fn verify_password(&self, password: &str) -> Result<bool> {
        self.wallets().verify_password(password).await
    }

    pub async fn create_account(
        &self,
        password: &str,
        name: &str,
        address_type: AddressType,
    ) -> Result<Account> {
        let record = self.wallets().get_current().await?;
        let master = self.master_key(password).await?;

        let mut account = new_account(record.next_account_index(), name, address_type, ImportType::Hd)?;
        next_single_sig_address(&mut account, &master, Branch::External)?;

        self.wallets()
            .add_account(WalletAccount::SingleSig(account.clone()))
            .await?;
        Ok(account)
    }

    /// Append the next address on `branch`. Multisig accounts need no
    /// password; single-sig accounts derive from their seed.
    pub async fn next_address(
        &self,
        password: &str,
        account_index: u32,
        branch: Branch,
    ) -> Result<AddressRecord> {
        let record = self.wallets().get_current().await?;
        let mut account = record.account(account_index)?.clone();

        let address = match &mut account {
            WalletAccount::SingleSig(single) => {
                let master = self.account_master(password, single, record.settings.network).await?;
                next_single_sig_address(single, &master, branch)?
            }
            WalletAccount::Multisig(multi) => next_multisig_address(multi, branch)?,
        };

        self.wallets().update_account(account).await?;
        Ok(address)
    }

    pub async fn next_multisig_address(&self, account_index: u32, branch: Branch) -> Result<AddressRecord> {
        let record = self.wallets().get_current().await?;
        let mut account = record.account(account_index)?.clone();

        let address = match &mut account {
            WalletAccount::Multisig(multi) => next_multisig_address(multi, branch)?,
            WalletAccount::SingleSig(_) => {
                return Err(KeystashError::validation(format!(
                    "Account {} is not a multisig account",
                    account_index
                )))
            }
        };

        self.wallets().update_account(account).await?;
        Ok(address)
    }

    /// Returns `false` if the address was already marked.
    pub async fn mark_address_used(&self, account_index: u32, address: &str) -> Result<bool> {
        let record = self.wallets().get_current().await?;
        let mut account = record.account(account_index)?.clone();

        if !mark_used(&mut account, address)? {
            return Ok(false);
        }
        self.wallets().update_account(account).await?;
        Ok(true)
    }

    /// Account-level extended public key for watch-only export.
    pub async fn export_account_xpub(&self, password: &str, account_index: u32) -> Result<String> {
        let record = self.wallets().get_current().await?;

        match record.account(account_index)? {
            WalletAccount::SingleSig(single) => {
                let master = self.account_master(password, single, record.settings.network).await?;
                let node = derive_account_node(&master, single.address_type, derivation_account(single))?;
                Ok(export_xpub(&node))
            }
            WalletAccount::Multisig(multi) => multi
                .cosigners
                .iter()
                .find(|c| c.is_self)
                .map(|c| c.xpub.clone())
                .ok_or_else(|| {
                    KeystashError::validation(format!(
                        "Multisig account {} has no local cosigner key",
                        account_index
                    ))
                }),
        }
    }

    /// This wallet's BIP48 key for sharing with cosigners.
    pub async fn multisig_xpub(
        &self,
        password: &str,
        account_index: u32,
        address_type: MultisigAddressType,
    ) -> Result<LocalCosigner> {
        let master = self.master_key(password).await?;
        derive_multisig_xpub(&master, account_index, address_type)
    }

    /// Validate cosigners, then store the account with its first receive
    /// address. `account_index` is both the wallet slot and the BIP48
    /// account level.
    pub async fn create_multisig_account(
        &self,
        password: &str,
        name: &str,
        config: MultisigConfig,
        address_type: MultisigAddressType,
        account_index: u32,
        cosigners: &[CosignerInput],
    ) -> Result<MultisigAccount> {
        let record = self.wallets().get_current().await?;
        if record.account(account_index).is_ok() {
            return Err(KeystashError::duplicate(format!(
                "Account index {} is already in use",
                account_index
            )));
        }

        let master = self.master_key(password).await?;
        let local = derive_multisig_xpub(&master, account_index, address_type)?;
        let mut account =
            create_multisig_account(name, config, address_type, account_index, &local, cosigners)?;
        next_multisig_address(&mut account, Branch::External)?;

        self.wallets()
            .add_account(WalletAccount::Multisig(account.clone()))
            .await?;
        Ok(account)
    }

    /// One-address account for a WIF key, stored encrypted under the wallet password.
    pub async fn import_private_key(
        &self,
        password: &str,
        name: &str,
        wif: &str,
        address_type: AddressType,
    ) -> Result<Account> {
        let record = self.wallets().get_current().await?;
        let network = record.settings.network;

        let decoded = decode_wif(wif, network)?;
        if !decoded.compressed && address_type != AddressType::Legacy {
            return Err(KeystashError::validation(
                "Uncompressed keys can only be imported as legacy addresses",
            ));
        }

        let mut account = new_account(record.next_account_index(), name, address_type, ImportType::PrivateKey)?;
        let address = single_sig_address(&decoded.public_key(), address_type, network);
        if record.accounts.iter().any(|a| a.addresses().iter().any(|r| r.address == address)) {
            return Err(KeystashError::duplicate(format!(
                "Address {} is already in this wallet",
                address
            )));
        }

        account.addresses.push(AddressRecord {
            address,
            derivation_path: "m".to_string(),
            index: 0,
            is_change: false,
            used: false,
            redeem_script: None,
            witness_script: None,
        });
        account.external_index = 1;

        self.wallets()
            .add_account_with_key(
                WalletAccount::SingleSig(account.clone()),
                wif.trim(),
                KeyType::PrivateKey,
                password,
            )
            .await?;
        Ok(account)
    }

    /// Account for a second recovery phrase, derived independently of the wallet seed.
    pub async fn import_seed_account(
        &self,
        password: &str,
        name: &str,
        mnemonic: &str,
        address_type: AddressType,
    ) -> Result<Account> {
        let record = self.wallets().get_current().await?;
        let network = record.settings.network;

        let phrase = normalize_mnemonic(mnemonic);
        let master = master_from_phrase(&phrase, network)?;
        let mut account = new_account(record.next_account_index(), name, address_type, ImportType::Seed)?;
        next_single_sig_address(&mut account, &master, Branch::External)?;

        self.wallets()
            .add_account_with_key(
                WalletAccount::SingleSig(account.clone()),
                &phrase,
                KeyType::Seed,
                password,
            )
            .await?;
        Ok(account)
    }

    /// Re-encrypt the companion stores, then the wallet record.
    ///
    /// On any failure the companions are put back as they were, so the
    /// wallet and its side records never end up under different passwords.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        check_password(new_password)?;
        self.wallets().unlock(old_password).await?;

        let companions = [self.contacts(), self.tx_metadata()];
        let mut snapshots = Vec::with_capacity(companions.len());
        for companion in &companions {
            snapshots.push(companion.export_raw().await?);
        }

        let mut result = Ok(());
        for companion in &companions {
            if let Err(e) = companion.rekey(old_password, new_password).await {
                tracing::warn!("Failed to re-key {}: {}", companion.name(), e);
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = self.wallets().change_password(old_password, new_password).await;
        }

        if result.is_err() {
            for (companion, snapshot) in companions.iter().zip(snapshots) {
                let restored = match snapshot {
                    Some(records) => companion.restore_raw(&records).await.map(|_| ()),
                    None => companion.clear().await,
                };
                if let Err(e) = restored {
                    tracing::error!("Could not restore {} after a failed password change: {}", companion.name(), e);
                }
            }
        }
        result
    }

    pub async fn add_pending_multisig_tx(&self, account_index: u32, psbt: &str) -> Result<PendingMultisigTx> {
        let psbt = psbt.trim();
        general_purpose::STANDARD
            .decode(psbt)
            .map_err(|e| KeystashError::validation(format!("PSBT is not valid base64: {}", e)))?;

        let tx = PendingMultisigTx::new(account_index, psbt);
        self.wallets().add_pending_multisig_tx(tx.clone()).await?;
        Ok(tx)
    }

    pub async fn remove_pending_multisig_tx(&self, id: Uuid) -> Result<bool> {
        self.wallets().remove_pending_multisig_tx(id).await
    }

    pub async fn migrate(&self) -> Result<bool> {
        self.wallets().migrate().await
    }

    pub async fn rollback_migration(&self) -> Result<()> {
        self.wallets().rollback_migration().await
    }

    /// Remove the wallet record and both companion stores.
    pub async fn delete_wallet(&self) -> Result<()> {
        if !self.has_wallet().await? {
            return Err(KeystashError::WalletNotFound);
        }
        self.wallets().delete_wallet().await?;
        self.contacts().clear().await?;
        self.tx_metadata().clear().await?;

        tracing::info!("Deleted wallet and companion records");
        Ok(())
    }

    async fn master_key(&self, password: &str) -> Result<KeyNode> {
        let wallet = self.wallets().get_wallet().await?;
        let phrase = self.wallets().unlock(password).await?;
        master_from_phrase(&phrase, wallet.network())
    }

    /// Master key an account derives from: the wallet seed, or its own
    /// imported seed.
    async fn account_master(&self, password: &str, account: &Account, network: WalletNetwork) -> Result<KeyNode> {
        match account.import_type {
            ImportType::Hd => self.master_key(password).await,
            ImportType::Seed => {
                let (_, phrase) = self.wallets().unlock_imported_key(account.index, password).await?;
                master_from_phrase(&phrase, network)
            }
            ImportType::PrivateKey => Err(KeystashError::validation(format!(
                "Account {} holds a single imported key and has no extended key",
                account.index
            ))),
        }
    }
}

fn master_from_phrase(mnemonic: &str, network: WalletNetwork) -> Result<KeyNode> {
    parse_mnemonic(mnemonic)?;
    let seed = mnemonic_to_seed(mnemonic, "")?;
    new_master_key(seed.as_bytes(), network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::TEST_MNEMONIC;
    use crate::multisig::fixtures::{XPUB_28645006, XPUB_B8688DF1};
    use crate::storage::{FailingStore, MemoryStore, WALLET_KEY};

    const PASSWORD: &str = "correct horse battery";

    async fn manager_with_wallet() -> WalletManager {
        let manager = WalletManager::new(Arc::new(MemoryStore::new()));
        manager
            .import_wallet(TEST_MNEMONIC, PASSWORD, WalletNetwork::Testnet)
            .await
            .unwrap();
        manager
    }

    fn cosigners() -> Vec<CosignerInput> {
        vec![
            CosignerInput {
                name: "Alice".to_string(),
                xpub: XPUB_B8688DF1.to_string(),
                fingerprint: "b8688df1".to_string(),
                derivation_path: None,
            },
            CosignerInput {
                name: "Bob".to_string(),
                xpub: XPUB_28645006.to_string(),
                fingerprint: "28645006".to_string(),
                derivation_path: None,
            },
        ]
    }

    #[tokio::test]
    async fn test_import_creates_default_account() {
        let manager = manager_with_wallet().await;
        let wallet = manager.wallet().await.unwrap();
        assert_eq!(wallet.version(), 2);

        let accounts = wallet.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name(), DEFAULT_ACCOUNT_NAME);
        assert_eq!(
            accounts[0].addresses()[0].address,
            "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl"
        );

        let err = manager.create_wallet(PASSWORD, WalletNetwork::Testnet).await.unwrap_err();
        assert!(matches!(err, KeystashError::WalletExists));
    }

    #[tokio::test]
    async fn test_create_wallet_returns_phrase() {
        let manager = WalletManager::new(Arc::new(MemoryStore::new()));
        let (record, mnemonic) = manager.create_wallet(PASSWORD, WalletNetwork::Mainnet).await.unwrap();
        assert_eq!(mnemonic.split_whitespace().count(), 24);
        assert_eq!(record.settings.network, WalletNetwork::Mainnet);
        assert_eq!(manager.unlock(PASSWORD).await.unwrap().as_str(), mnemonic.as_str());
    }

    #[tokio::test]
    async fn test_next_address_and_mark_used() {
        let manager = manager_with_wallet().await;

        let second = manager.next_address(PASSWORD, 0, Branch::External).await.unwrap();
        assert_eq!(second.index, 1);
        let change = manager.next_address(PASSWORD, 0, Branch::Internal).await.unwrap();
        assert_eq!(change.derivation_path, "m/84'/1'/0'/1/0");

        assert!(manager.mark_address_used(0, &second.address).await.unwrap());
        assert!(!manager.mark_address_used(0, &second.address).await.unwrap());

        let wallet = manager.wallet().await.unwrap();
        let account = &wallet.accounts()[0];
        assert_eq!(account.counter(Branch::External), 2);
        assert_eq!(account.counter(Branch::Internal), 1);
        assert!(account.addresses()[1].used);

        assert!(manager.next_address("wrong password", 0, Branch::External).await.is_err());
        assert!(matches!(
            manager.next_address(PASSWORD, 9, Branch::External).await,
            Err(KeystashError::AccountNotFound { index: 9 })
        ));
    }

    #[tokio::test]
    async fn test_create_account_uses_next_index() {
        let manager = manager_with_wallet().await;
        let account = manager
            .create_account(PASSWORD, "Savings", AddressType::Legacy)
            .await
            .unwrap();
        assert_eq!(account.index, 1);
        assert_eq!(account.addresses[0].derivation_path, "m/44'/1'/1'/0/0");

        let xpub = manager.export_account_xpub(PASSWORD, 1).await.unwrap();
        assert!(xpub.starts_with("tpub"));
    }

    #[tokio::test]
    async fn test_multisig_account_lifecycle() {
        let manager = manager_with_wallet().await;
        let config: MultisigConfig = "2-of-3".parse().unwrap();

        let local = manager
            .multisig_xpub(PASSWORD, 1, MultisigAddressType::P2wsh)
            .await
            .unwrap();
        assert_eq!(local.derivation_path, "m/48'/1'/1'/2'");
        assert_eq!(local.fingerprint, "73c5da0a");

        let err = manager
            .create_multisig_account(PASSWORD, "Vault", config, MultisigAddressType::P2wsh, 0, &cosigners())
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::Duplicate(_)));

        let account = manager
            .create_multisig_account(PASSWORD, "Vault", config, MultisigAddressType::P2wsh, 1, &cosigners())
            .await
            .unwrap();
        assert_eq!(account.cosigners[0].xpub, local.xpub);
        assert_eq!(account.external_index, 1);
        assert!(account.addresses[0].address.starts_with("tb1q"));
        assert!(account.addresses[0].witness_script.is_some());
        assert_eq!(manager.export_account_xpub(PASSWORD, 1).await.unwrap(), local.xpub);

        let next = manager.next_multisig_address(1, Branch::External).await.unwrap();
        assert_eq!(next.index, 1);
        assert_eq!(next.derivation_path, "m/48'/1'/1'/2'/0/1");
        assert!(manager.next_multisig_address(0, Branch::External).await.is_err());

        let tx = manager.add_pending_multisig_tx(1, "cHNidP8BAA==").await.unwrap();
        assert!(manager.remove_pending_multisig_tx(tx.id).await.unwrap());
        assert!(manager.add_pending_multisig_tx(1, "not base64!").await.is_err());
    }

    #[tokio::test]
    async fn test_import_private_key() {
        let manager = manager_with_wallet().await;
        let wif = "cTGhosGriPpuGA586jemcuH9pE9spwUmneMBmYYzrQEbY92DJrbo";

        // Same key as the wallet's first address.
        let err = manager
            .import_private_key(PASSWORD, "Paper", wif, AddressType::NativeSegwit)
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::Duplicate(_)));

        let account = manager
            .import_private_key(PASSWORD, "Paper", wif, AddressType::Legacy)
            .await
            .unwrap();
        assert_eq!(account.import_type, ImportType::PrivateKey);
        assert_eq!(account.external_index, 1);
        assert!(manager.next_address(PASSWORD, account.index, Branch::External).await.is_err());

        let mainnet = "KyZpNDKnfs94vbrwhJneDi77V6jF64PWPF8x5cdJb8ifgg2DUc9d";
        assert!(matches!(
            manager.import_private_key(PASSWORD, "Foreign", mainnet, AddressType::Legacy).await,
            Err(KeystashError::NetworkMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_import_seed_account_derives_independently() {
        let manager = manager_with_wallet().await;
        let other = "legal winner thank year wave sausage worth useful legal winner thank yellow";

        let account = manager
            .import_seed_account(PASSWORD, "Old phone", other, AddressType::NativeSegwit)
            .await
            .unwrap();
        assert_eq!(account.import_type, ImportType::Seed);
        assert_eq!(account.addresses[0].derivation_path, "m/84'/1'/0'/0/0");
        assert_ne!(account.addresses[0].address, "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl");

        let next = manager.next_address(PASSWORD, account.index, Branch::External).await.unwrap();
        assert_eq!(next.index, 1);
    }

    #[tokio::test]
    async fn test_change_password_rekeys_everything() {
        let manager = manager_with_wallet().await;
        let contacts = manager.contacts();
        contacts
            .put(
                "alice",
                &crate::storage::Contact {
                    name: "Alice".to_string(),
                    address: "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl".to_string(),
                    notes: None,
                },
                PASSWORD,
            )
            .await
            .unwrap();

        manager.change_password(PASSWORD, "another long password").await.unwrap();

        assert!(!manager.verify_password(PASSWORD).await.unwrap());
        assert!(manager.verify_password("another long password").await.unwrap());
        let listed: std::collections::BTreeMap<String, crate::storage::Contact> =
            contacts.list("another long password").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_password_change_keeps_old_password() {
        let store = Arc::new(FailingStore::new(WALLET_KEY));
        let manager = WalletManager::new(store.clone());
        manager
            .import_wallet(TEST_MNEMONIC, PASSWORD, WalletNetwork::Testnet)
            .await
            .unwrap();
        let contacts = manager.contacts();
        contacts
            .put(
                "alice",
                &crate::storage::Contact {
                    name: "Alice".to_string(),
                    address: "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl".to_string(),
                    notes: None,
                },
                PASSWORD,
            )
            .await
            .unwrap();
        store.arm();

        let err = manager
            .change_password(PASSWORD, "another long password")
            .await
            .unwrap_err();
        assert!(matches!(err, KeystashError::Storage(_)));

        assert!(manager.verify_password(PASSWORD).await.unwrap());
        let listed: std::collections::BTreeMap<String, crate::storage::Contact> =
            contacts.list(PASSWORD).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(manager.tx_metadata().export_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_wallet() {
        let manager = manager_with_wallet().await;
        manager.delete_wallet().await.unwrap();
        assert!(!manager.has_wallet().await.unwrap());
        assert!(matches!(
            manager.delete_wallet().await,
            Err(KeystashError::WalletNotFound)
        ));
    }
}
