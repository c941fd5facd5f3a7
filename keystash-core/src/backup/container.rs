//! On-disk backup format.

use crate::crypto::blob::{decode, expect_len};
use crate::crypto::{sha256_hex, ALGORITHM, IV_SIZE, MIN_ITERATIONS, SALT_SIZE};
use crate::error::{KeystashError, Result};
use crate::storage::EncryptedRecords;
use crate::types::WalletNetwork;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BACKUP_MAGIC: &str = "KEYSTASH_BACKUP";
pub const BACKUP_VERSION: u32 = 1;
pub const PAYLOAD_VERSION: u32 = 1;
pub const CHECKSUM_ALGORITHM: &str = "SHA-256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHeader {
    pub magic: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub network: String,
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionParams {
    pub algorithm: String,
    pub iterations: u32,
    pub salt: String,
    pub iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checksum {
    pub algorithm: String,
    pub hash: String,
}

/// A password-protected snapshot of the wallet and its companion stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupContainer {
    pub header: BackupHeader,
    pub encryption_params: EncryptionParams,
    pub ciphertext: String,
    pub checksum: Checksum,
}

impl BackupContainer {
    /// Check everything that can be checked without the password and
    /// return the header network.
    pub fn validate_shape(&self) -> Result<WalletNetwork> {
        if self.header.magic != BACKUP_MAGIC {
            return Err(KeystashError::validation("Not a keystash backup file"));
        }
        if self.header.version > BACKUP_VERSION {
            return Err(KeystashError::Version {
                found: self.header.version,
                supported: BACKUP_VERSION,
            });
        }
        if self.header.version == 0 {
            return Err(KeystashError::validation("Backup version must be at least 1"));
        }
        let network = self.header.network.parse::<WalletNetwork>()?;

        let params = &self.encryption_params;
        if params.algorithm != ALGORITHM {
            return Err(KeystashError::validation(format!(
                "Unsupported backup cipher '{}'",
                params.algorithm
            )));
        }
        if params.iterations < MIN_ITERATIONS {
            return Err(KeystashError::validation(format!(
                "Backup iteration count {} is below the minimum of {}",
                params.iterations, MIN_ITERATIONS
            )));
        }
        expect_len("salt", &params.salt, SALT_SIZE)?;
        expect_len("iv", &params.iv, IV_SIZE)?;

        if self.ciphertext.is_empty() {
            return Err(KeystashError::validation("Backup has empty ciphertext"));
        }
        decode("ciphertext", &self.ciphertext)?;

        if self.checksum.algorithm != CHECKSUM_ALGORITHM {
            return Err(KeystashError::validation(format!(
                "Unsupported checksum algorithm '{}'",
                self.checksum.algorithm
            )));
        }
        if self.checksum.hash.len() != 64 || hex::decode(&self.checksum.hash).is_err() {
            return Err(KeystashError::validation("Backup checksum must be 64 hex characters"));
        }

        Ok(network)
    }

    /// Recompute the checksum over the ciphertext bytes.
    pub fn verify_checksum(&self) -> Result<()> {
        let ciphertext = decode("ciphertext", &self.ciphertext)?;
        if sha256_hex(&ciphertext) != self.checksum.hash.to_lowercase() {
            return Err(KeystashError::Integrity);
        }
        Ok(())
    }
}

/// The decrypted contents of a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    pub version: u32,
    pub network: WalletNetwork,
    pub exported_at: DateTime<Utc>,
    /// The stored wallet record exactly as persisted.
    pub wallet: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<EncryptedRecords>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_metadata: Option<EncryptedRecords>,
}
