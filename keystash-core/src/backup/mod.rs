//! Portable, password-protected backups of the whole wallet state.
//!
//! The wallet record inside a backup is still sealed under the wallet
//! password; the backup password adds a second layer over the whole
//! payload. The checksum covers the ciphertext so tampering is caught
//! before any decryption is attempted.

pub mod container;

pub use container::{
    BackupContainer, BackupHeader, BackupPayload, Checksum, EncryptionParams, BACKUP_MAGIC,
    BACKUP_VERSION, CHECKSUM_ALGORITHM, PAYLOAD_VERSION,
};

use crate::crypto::blob::{decode, encode, expect_len};
use crate::crypto::{
    decrypt_with_key, derive_key, encrypt_with_key, generate_salt, sha256_hex, ALGORITHM,
    BACKUP_ITERATIONS, MIN_ITERATIONS, SALT_SIZE,
};
use crate::error::{KeystashError, Result};
use crate::storage::{EncryptedRecords, KeyValueStore, RecordStore, StoredWallet, WalletStore};
use crate::types::WalletNetwork;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

pub const MIN_BACKUP_PASSWORD_LENGTH: usize = 12;

/// Progress through the export and import state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    VerifyWalletPassword,
    GatherState,
    Serialize,
    DeriveKey,
    Encrypt,
    Checksum,
    EmitContainer,
    ValidateContainer,
    VerifyChecksum,
    Decrypt,
    ValidatePayload,
    WriteWallet,
    RestoreCompanions,
    Complete,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackupStage::VerifyWalletPassword => "Verifying wallet password",
            BackupStage::GatherState => "Gathering wallet state",
            BackupStage::Serialize => "Serializing",
            BackupStage::DeriveKey => "Deriving backup key",
            BackupStage::Encrypt => "Encrypting",
            BackupStage::Checksum => "Computing checksum",
            BackupStage::EmitContainer => "Writing container",
            BackupStage::ValidateContainer => "Validating container",
            BackupStage::VerifyChecksum => "Verifying checksum",
            BackupStage::Decrypt => "Decrypting",
            BackupStage::ValidatePayload => "Validating contents",
            BackupStage::WriteWallet => "Restoring wallet",
            BackupStage::RestoreCompanions => "Restoring contacts and labels",
            BackupStage::Complete => "Done",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Overwrite a wallet that already exists in the store.
    pub replace_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub network: WalletNetwork,
    pub accounts: usize,
    pub multisig_accounts: usize,
    pub addresses: usize,
    pub imported_keys: usize,
    pub contacts_restored: usize,
    pub transaction_metadata_restored: usize,
    pub companion_errors: Vec<String>,
    pub backup_created_at: DateTime<Utc>,
}

pub struct BackupManager {
    store: Arc<dyn KeyValueStore>,
    iterations: u32,
}

impl BackupManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            iterations: BACKUP_ITERATIONS,
        }
    }

    /// Override the KDF cost of exported backups. Never below the minimum.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(MIN_ITERATIONS);
        self
    }

    fn wallets(&self) -> WalletStore<'_> {
        WalletStore::new(self.store.as_ref())
    }

    pub async fn export(&self, wallet_password: &str, backup_password: &str) -> Result<BackupContainer> {
        self.export_with_progress(wallet_password, backup_password, |_| {})
            .await
    }

    /// Snapshot the wallet and companion stores into a sealed container.
    /// Nothing is returned unless every stage succeeds.
    pub async fn export_with_progress<F>(
        &self,
        wallet_password: &str,
        backup_password: &str,
        mut progress: F,
    ) -> Result<BackupContainer>
    where
        F: FnMut(BackupStage),
    {
        check_backup_password(wallet_password, backup_password)?;

        stage(&mut progress, BackupStage::VerifyWalletPassword);
        let wallets = self.wallets();
        wallets.unlock(wallet_password).await?;

        stage(&mut progress, BackupStage::GatherState);
        let wallet = wallets.get_wallet().await?;
        let network = wallet.network();
        let payload = BackupPayload {
            version: PAYLOAD_VERSION,
            network,
            exported_at: Utc::now(),
            wallet: wallet.to_value()?,
            contacts: RecordStore::contacts(self.store.clone()).export_raw().await?,
            transaction_metadata: RecordStore::tx_metadata(self.store.clone())
                .export_raw()
                .await?,
        };

        stage(&mut progress, BackupStage::Serialize);
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);

        stage(&mut progress, BackupStage::DeriveKey);
        let salt = generate_salt();
        let key = derive_key(backup_password, &salt, self.iterations)?;

        stage(&mut progress, BackupStage::Encrypt);
        let (ciphertext, iv) = encrypt_with_key(&key, &plaintext)?;

        stage(&mut progress, BackupStage::Checksum);
        let hash = sha256_hex(&ciphertext);

        stage(&mut progress, BackupStage::EmitContainer);
        let container = BackupContainer {
            header: BackupHeader {
                magic: BACKUP_MAGIC.to_string(),
                version: BACKUP_VERSION,
                created_at: payload.exported_at,
                network: network.to_string(),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            encryption_params: EncryptionParams {
                algorithm: ALGORITHM.to_string(),
                iterations: self.iterations,
                salt: encode(&salt),
                iv: encode(&iv),
            },
            ciphertext: encode(&ciphertext),
            checksum: Checksum {
                algorithm: CHECKSUM_ALGORITHM.to_string(),
                hash,
            },
        };

        info!(
            "Exported {} backup with {} account(s)",
            network,
            wallet.accounts().len()
        );
        Ok(container)
    }

    pub async fn import(
        &self,
        container: &BackupContainer,
        backup_password: &str,
        options: ImportOptions,
    ) -> Result<ImportSummary> {
        self.import_with_progress(container, backup_password, options, |_| {})
            .await
    }

    /// Restore a container into the store. The wallet is either fully
    /// restored or the previous record is left in place; companion stores
    /// are restored best effort.
    pub async fn import_with_progress<F>(
        &self,
        container: &BackupContainer,
        backup_password: &str,
        options: ImportOptions,
        mut progress: F,
    ) -> Result<ImportSummary>
    where
        F: FnMut(BackupStage),
    {
        stage(&mut progress, BackupStage::ValidateContainer);
        let network = container.validate_shape()?;

        let wallets = self.wallets();
        let existing = wallets.has_wallet().await?;
        if existing && !options.replace_existing {
            return Err(KeystashError::WalletExists);
        }

        stage(&mut progress, BackupStage::VerifyChecksum);
        container.verify_checksum()?;

        stage(&mut progress, BackupStage::DeriveKey);
        let params = &container.encryption_params;
        let salt = expect_len("salt", &params.salt, SALT_SIZE)?;
        let key = derive_key(backup_password, &salt, params.iterations)?;

        stage(&mut progress, BackupStage::Decrypt);
        let ciphertext = decode("ciphertext", &container.ciphertext)?;
        let iv = decode("iv", &params.iv)?;
        let plaintext = decrypt_with_key(&key, &ciphertext, &iv)?;

        stage(&mut progress, BackupStage::ValidatePayload);
        let payload: BackupPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| KeystashError::validation(format!("Backup contents are malformed: {}", e)))?;
        if payload.version > PAYLOAD_VERSION {
            return Err(KeystashError::Version {
                found: payload.version,
                supported: PAYLOAD_VERSION,
            });
        }
        if payload.network != network {
            return Err(KeystashError::network_mismatch(network, payload.network));
        }
        let wallet = StoredWallet::from_value(payload.wallet.clone())?;
        wallet.validate()?;
        if wallet.network() != network {
            return Err(KeystashError::network_mismatch(network, wallet.network()));
        }
        for records in [&payload.contacts, &payload.transaction_metadata]
            .into_iter()
            .flatten()
        {
            records.validate()?;
        }

        stage(&mut progress, BackupStage::WriteWallet);
        let snapshot = wallets.get_raw().await?;
        let written = match wallets.replace_wallet(&wallet).await {
            // A snapshot left over from the replaced record must not survive it.
            Ok(()) => wallets.clear_migration_snapshot().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Restoring wallet failed, putting the previous record back: {}", e);
            if let Err(restore) = wallets.put_raw(snapshot).await {
                error!("Could not put the previous wallet record back: {}", restore);
            }
            return Err(e);
        }

        stage(&mut progress, BackupStage::RestoreCompanions);
        let mut companion_errors = Vec::new();
        let contacts_restored = self
            .restore_companion(
                RecordStore::contacts(self.store.clone()),
                payload.contacts.as_ref(),
                existing,
                &mut companion_errors,
            )
            .await;
        let transaction_metadata_restored = self
            .restore_companion(
                RecordStore::tx_metadata(self.store.clone()),
                payload.transaction_metadata.as_ref(),
                existing,
                &mut companion_errors,
            )
            .await;

        stage(&mut progress, BackupStage::Complete);
        let accounts = wallet.accounts();
        let summary = ImportSummary {
            network,
            accounts: accounts.len(),
            multisig_accounts: accounts.iter().filter(|a| a.is_multisig()).count(),
            addresses: accounts.iter().map(|a| a.addresses().len()).sum(),
            imported_keys: wallet.imported_key_count(),
            contacts_restored,
            transaction_metadata_restored,
            companion_errors,
            backup_created_at: container.header.created_at,
        };

        info!(
            "Imported {} backup: {} account(s), {} address(es)",
            network, summary.accounts, summary.addresses
        );
        Ok(summary)
    }

    /// Failures are recorded in `errors` rather than returned.
    async fn restore_companion(
        &self,
        records: RecordStore,
        restored: Option<&EncryptedRecords>,
        replacing: bool,
        errors: &mut Vec<String>,
    ) -> usize {
        let result = match restored {
            Some(restored) => records.restore_raw(restored).await,
            // Items sealed under the replaced wallet's password would be orphaned.
            None if replacing => records.clear().await.map(|_| 0),
            None => Ok(0),
        };
        match result {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to restore {}: {}", records.name(), e);
                errors.push(format!("{}: {}", records.name(), e));
                0
            }
        }
    }

    pub async fn export_to_file(
        &self,
        path: &Path,
        wallet_password: &str,
        backup_password: &str,
    ) -> Result<BackupContainer> {
        let container = self.export(wallet_password, backup_password).await?;
        let json = serde_json::to_string_pretty(&container)?;

        tokio::fs::write(path, json).await?;
        info!("Exported backup to file: {}", path.display());
        Ok(container)
    }

    pub async fn import_from_file(
        &self,
        path: &Path,
        backup_password: &str,
        options: ImportOptions,
    ) -> Result<ImportSummary> {
        let container = read_container(path).await?;
        let summary = self.import(&container, backup_password, options).await?;
        info!("Imported backup from file: {}", path.display());
        Ok(summary)
    }
}

pub async fn read_container(path: &Path) -> Result<BackupContainer> {
    let json = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&json)
        .map_err(|e| KeystashError::validation(format!("Not a keystash backup file: {}", e)))
}

fn check_backup_password(wallet_password: &str, backup_password: &str) -> Result<()> {
    if backup_password == wallet_password {
        return Err(KeystashError::validation(
            "Backup password must differ from the wallet password",
        ));
    }
    if backup_password.chars().count() < MIN_BACKUP_PASSWORD_LENGTH {
        return Err(KeystashError::validation(format!(
            "Backup password must be at least {} characters",
            MIN_BACKUP_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn stage<F: FnMut(BackupStage)>(progress: &mut F, current: BackupStage) {
    debug!("Backup stage: {}", current);
    progress(current);
}
