//! The persisted wallet record and its shape validation.
//!
//! Records carry an integer `"version"` field. Version 1 predates multisig
//! and imported keys; version 2 is current. Every write goes through
//! [`StoredWallet::validate`].

use crate::crypto::blob::decode;
use crate::crypto::EncryptedBlob;
use crate::error::{KeystashError, Result};
use crate::keys::parse_path;
use crate::multisig::{parse_fingerprint, parse_xpub};
use crate::types::{
    Account, AddressRecord, Branch, ImportType, MultisigAccount, MultisigAddressType,
    WalletAccount, WalletNetwork,
};
use crate::wallet::WalletSettings;
use bitcoin::bip32::ChildNumber;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

pub const WALLET_KEY: &str = "wallet";
pub const PREMIGRATION_KEY: &str = "wallet_premigration";
pub const CURRENT_WALLET_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    PrivateKey,
    Seed,
}

/// Secret for an account that does not derive from the wallet seed.
/// The payload is a WIF string or a mnemonic phrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedKey {
    #[serde(flatten)]
    pub blob: EncryptedBlob,
    pub key_type: KeyType,
}

/// A partially signed multisig transaction awaiting more signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMultisigTx {
    pub id: Uuid,
    pub account_index: u32,
    /// Base64 PSBT.
    pub psbt: String,
    /// Fingerprints of the cosigners that have signed.
    #[serde(default)]
    pub signed_by: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingMultisigTx {
    pub fn new(account_index: u32, psbt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_index,
            psbt: psbt.into(),
            signed_by: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecordV1 {
    pub encrypted_seed: EncryptedBlob,
    pub accounts: Vec<Account>,
    pub settings: WalletSettings,
}

impl WalletRecordV1 {
    pub fn into_v2(self) -> WalletRecordV2 {
        WalletRecordV2 {
            encrypted_seed: self.encrypted_seed,
            accounts: self
                .accounts
                .into_iter()
                .map(WalletAccount::SingleSig)
                .collect(),
            settings: self.settings,
            imported_keys: BTreeMap::new(),
            pending_multisig_txs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecordV2 {
    pub encrypted_seed: EncryptedBlob,
    pub accounts: Vec<WalletAccount>,
    pub settings: WalletSettings,
    /// Keyed by account index.
    #[serde(default)]
    pub imported_keys: BTreeMap<u32, ImportedKey>,
    #[serde(default)]
    pub pending_multisig_txs: Vec<PendingMultisigTx>,
}

impl WalletRecordV2 {
    pub fn new(encrypted_seed: EncryptedBlob, settings: WalletSettings) -> Self {
        Self {
            encrypted_seed,
            accounts: Vec::new(),
            settings,
            imported_keys: BTreeMap::new(),
            pending_multisig_txs: Vec::new(),
        }
    }

    pub fn account(&self, index: u32) -> Result<&WalletAccount> {
        self.accounts
            .iter()
            .find(|a| a.index() == index)
            .ok_or(KeystashError::AccountNotFound { index })
    }

    pub fn account_mut(&mut self, index: u32) -> Result<&mut WalletAccount> {
        self.accounts
            .iter_mut()
            .find(|a| a.index() == index)
            .ok_or(KeystashError::AccountNotFound { index })
    }

    /// Lowest index not yet taken.
    pub fn next_account_index(&self) -> u32 {
        let taken: HashSet<u32> = self.accounts.iter().map(WalletAccount::index).collect();
        (0..).find(|i| !taken.contains(i)).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredWallet {
    V1(WalletRecordV1),
    V2(WalletRecordV2),
}

impl StoredWallet {
    pub fn version(&self) -> u32 {
        match self {
            StoredWallet::V1(_) => 1,
            StoredWallet::V2(_) => 2,
        }
    }

    pub fn encrypted_seed(&self) -> &EncryptedBlob {
        match self {
            StoredWallet::V1(record) => &record.encrypted_seed,
            StoredWallet::V2(record) => &record.encrypted_seed,
        }
    }

    pub fn settings(&self) -> &WalletSettings {
        match self {
            StoredWallet::V1(record) => &record.settings,
            StoredWallet::V2(record) => &record.settings,
        }
    }

    pub fn network(&self) -> WalletNetwork {
        self.settings().network
    }

    /// All accounts in the current representation.
    pub fn accounts(&self) -> Vec<WalletAccount> {
        match self {
            StoredWallet::V1(record) => record
                .accounts
                .iter()
                .cloned()
                .map(WalletAccount::SingleSig)
                .collect(),
            StoredWallet::V2(record) => record.accounts.clone(),
        }
    }

    pub fn imported_key_count(&self) -> usize {
        match self {
            StoredWallet::V1(_) => 0,
            StoredWallet::V2(record) => record.imported_keys.len(),
        }
    }

    /// The current-version record, or `MigrationRequired`.
    pub fn as_current(&self) -> Result<&WalletRecordV2> {
        match self {
            StoredWallet::V2(record) => Ok(record),
            StoredWallet::V1(_) => Err(KeystashError::MigrationRequired { version: 1 }),
        }
    }

    pub fn into_current(self) -> Result<WalletRecordV2> {
        match self {
            StoredWallet::V2(record) => Ok(record),
            StoredWallet::V1(_) => Err(KeystashError::MigrationRequired { version: 1 }),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let mut value = match self {
            StoredWallet::V1(record) => serde_json::to_value(record)?,
            StoredWallet::V2(record) => serde_json::to_value(record)?,
        };
        let object = value
            .as_object_mut()
            .ok_or_else(|| KeystashError::internal("Wallet record did not serialize to an object"))?;
        object.insert("version".to_string(), Value::from(self.version()));
        Ok(value)
    }

    /// Dispatch on `"version"`. Shape is checked separately by [`validate`](Self::validate).
    pub fn from_value(value: Value) -> Result<Self> {
        let version = value
            .get("version")
            .ok_or_else(|| KeystashError::validation("Wallet record has no version field"))?
            .as_u64()
            .ok_or_else(|| KeystashError::validation("Wallet record version must be an integer"))?;

        match version {
            1 => Ok(StoredWallet::V1(decode_record(value)?)),
            2 => Ok(StoredWallet::V2(decode_record(value)?)),
            found => Err(KeystashError::Version {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                supported: CURRENT_WALLET_VERSION,
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.encrypted_seed()
            .validate(true)
            .map_err(|e| invalid(format!("encrypted seed: {}", e)))?;
        self.settings()
            .validate()
            .map_err(|e| invalid(format!("settings: {}", e)))?;

        let network = self.network();
        let accounts = self.accounts();

        let mut indices = HashSet::new();
        for account in &accounts {
            if !indices.insert(account.index()) {
                return Err(invalid(format!(
                    "account index {} appears more than once",
                    account.index()
                )));
            }
            validate_account(account, network)?;
        }

        if let StoredWallet::V2(record) = self {
            validate_imported_keys(record)?;
            validate_pending(record)?;
        } else {
            for account in &accounts {
                if account.import_type() != ImportType::Hd {
                    return Err(invalid(format!(
                        "version 1 account {} cannot be an imported account",
                        account.index()
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Serialize for StoredWallet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StoredWallet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        StoredWallet::from_value(value).map_err(de::Error::custom)
    }
}

fn decode_record<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| KeystashError::validation(format!("Malformed wallet record: {}", e)))
}

fn invalid(msg: impl std::fmt::Display) -> KeystashError {
    KeystashError::validation(format!("Invalid wallet record: {}", msg))
}

fn branch_label(branch: Branch) -> &'static str {
    match branch {
        Branch::External => "receive",
        Branch::Internal => "change",
    }
}

fn validate_account(account: &WalletAccount, network: WalletNetwork) -> Result<()> {
    let label = format!("account {}", account.index());
    if account.name().trim().is_empty() {
        return Err(invalid(format!("{} has an empty name", label)));
    }

    validate_addresses(&label, account)?;

    match account {
        WalletAccount::SingleSig(single) => validate_single_sig(&label, single),
        WalletAccount::Multisig(multi) => validate_multisig(&label, multi, network),
    }
}

/// Counters equal per-branch counts and indices cover exactly `[0, counter)`.
fn validate_addresses(label: &str, account: &WalletAccount) -> Result<()> {
    for record in account.addresses() {
        if record.address.trim().is_empty() {
            return Err(invalid(format!("{} has an address with no text", label)));
        }
        if record.derivation_path.trim().is_empty() {
            return Err(invalid(format!(
                "{} address {} has no derivation path",
                label, record.address
            )));
        }
        check_path_matches(label, record)?;
    }

    for branch in [Branch::External, Branch::Internal] {
        let counter = account.counter(branch);
        let mut indices: Vec<u32> = account
            .addresses()
            .iter()
            .filter(|r| r.branch() == branch)
            .map(|r| r.index)
            .collect();
        indices.sort_unstable();

        if indices.len() != counter as usize {
            return Err(invalid(format!(
                "{} {} counter is {} but {} addresses are stored",
                label,
                branch_label(branch),
                counter,
                indices.len()
            )));
        }
        for (expected, index) in indices.iter().enumerate() {
            if *index != expected as u32 {
                return Err(invalid(format!(
                    "{} {} addresses are not contiguous at index {}",
                    label,
                    branch_label(branch),
                    expected
                )));
            }
        }
    }

    Ok(())
}

/// The trailing `/{change}/{index}` of a derived path must agree with the record.
fn check_path_matches(label: &str, record: &AddressRecord) -> Result<()> {
    let path = parse_path(&record.derivation_path).map_err(|e| invalid(format!("{}: {}", label, e)))?;
    let children = path.as_ref();
    if children.len() < 2 {
        return Ok(());
    }

    let tail = (&children[children.len() - 2], &children[children.len() - 1]);
    let expected = (record.branch().index(), record.index);
    match tail {
        (ChildNumber::Normal { index: change }, ChildNumber::Normal { index })
            if (*change, *index) == expected =>
        {
            Ok(())
        }
        _ => Err(invalid(format!(
            "{} address {} has path {} inconsistent with its branch and index",
            label, record.address, record.derivation_path
        ))),
    }
}

fn validate_single_sig(label: &str, account: &Account) -> Result<()> {
    if account.import_type == ImportType::PrivateKey
        && (account.external_index > 1 || account.internal_index > 0)
    {
        return Err(invalid(format!(
            "{} imports a single private key and can hold only one address",
            label
        )));
    }
    Ok(())
}

fn validate_multisig(label: &str, account: &MultisigAccount, network: WalletNetwork) -> Result<()> {
    let n = account.config.n() as usize;
    if account.cosigners.len() != n {
        return Err(invalid(format!(
            "{} is {} but lists {} cosigners",
            label,
            account.config,
            account.cosigners.len()
        )));
    }

    if account.cosigners.iter().filter(|c| c.is_self).count() > 1 {
        return Err(invalid(format!("{} marks more than one cosigner as self", label)));
    }

    let mut keys = HashSet::new();
    for cosigner in &account.cosigners {
        if cosigner.name.trim().is_empty() {
            return Err(invalid(format!("{} has a cosigner with no name", label)));
        }
        parse_fingerprint(&cosigner.fingerprint)
            .map_err(|e| invalid(format!("{}: {}", label, e)))?;
        parse_path(&cosigner.derivation_path).map_err(|e| invalid(format!("{}: {}", label, e)))?;
        let xpub = parse_xpub(&cosigner.xpub, network)
            .map_err(|e| invalid(format!("{} cosigner '{}': {}", label, cosigner.name, e)))?;
        if !keys.insert(xpub.to_string()) {
            return Err(invalid(format!("{} repeats a cosigner key", label)));
        }
    }

    let (needs_redeem, needs_witness) = match account.address_type {
        MultisigAddressType::P2sh => (true, false),
        MultisigAddressType::P2wsh => (false, true),
        MultisigAddressType::P2shP2wsh => (true, true),
    };
    for record in &account.addresses {
        for (name, script, required) in [
            ("redeemScript", &record.redeem_script, needs_redeem),
            ("witnessScript", &record.witness_script, needs_witness),
        ] {
            match script {
                Some(text) if hex::decode(text).map(|b| b.is_empty()).unwrap_or(true) => {
                    return Err(invalid(format!(
                        "{} address {} has a malformed {}",
                        label, record.address, name
                    )))
                }
                None if required => {
                    return Err(invalid(format!(
                        "{} address {} is missing its {}",
                        label, record.address, name
                    )))
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn validate_imported_keys(record: &WalletRecordV2) -> Result<()> {
    for (index, key) in &record.imported_keys {
        key.blob
            .validate(true)
            .map_err(|e| invalid(format!("imported key {}: {}", index, e)))?;

        let account = record
            .account(*index)
            .map_err(|_| invalid(format!("imported key {} has no account", index)))?;
        let expected = match key.key_type {
            KeyType::PrivateKey => ImportType::PrivateKey,
            KeyType::Seed => ImportType::Seed,
        };
        if account.import_type() != expected {
            return Err(invalid(format!(
                "imported key {} does not match the account's import type",
                index
            )));
        }
    }

    Ok(())
}

fn validate_pending(record: &WalletRecordV2) -> Result<()> {
    let mut ids = HashSet::new();
    for tx in &record.pending_multisig_txs {
        if !ids.insert(tx.id) {
            return Err(invalid(format!("pending transaction {} appears twice", tx.id)));
        }
        match record.account(tx.account_index) {
            Ok(account) if account.is_multisig() => {}
            _ => {
                return Err(invalid(format!(
                    "pending transaction {} does not belong to a multisig account",
                    tx.id
                )))
            }
        }
        if tx.psbt.is_empty() {
            return Err(invalid(format!("pending transaction {} has no PSBT", tx.id)));
        }
        decode("psbt", &tx.psbt).map_err(|e| invalid(format!("pending transaction {}: {}", tx.id, e)))?;
        for fingerprint in &tx.signed_by {
            parse_fingerprint(fingerprint)
                .map_err(|e| invalid(format!("pending transaction {}: {}", tx.id, e)))?;
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_dispatch() {
        let v1 = StoredWallet::V1(wallet_v1());
        let value = v1.to_value().unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(StoredWallet::from_value(value).unwrap(), v1);

        let v2 = StoredWallet::V2(wallet_v1().into_v2());
        let value = v2.to_value().unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["accounts"][0]["accountType"], "single-sig");
        assert_eq!(StoredWallet::from_value(value).unwrap(), v2);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut value = StoredWallet::V2(wallet_v1().into_v2()).to_value().unwrap();
        value["version"] = json!(3);
        assert!(matches!(
            StoredWallet::from_value(value),
            Err(KeystashError::Version { found: 3, supported: 2 })
        ));

        assert!(StoredWallet::from_value(json!({ "accounts": [] })).is_err());
    }

    #[test]
    fn test_v1_requires_migration() {
        let v1 = StoredWallet::V1(wallet_v1());
        assert!(matches!(
            v1.as_current(),
            Err(KeystashError::MigrationRequired { version: 1 })
        ));
        v1.validate().unwrap();
    }

    #[test]
    fn test_rejects_gaps_and_counter_drift() {
        let mut record = wallet_v1().into_v2();
        StoredWallet::V2(record.clone()).validate().unwrap();

        if let WalletAccount::SingleSig(account) = &mut record.accounts[0] {
            account.addresses.remove(1);
            account.addresses.push(super::test_support::record(3, Branch::External));
        }
        let err = StoredWallet::V2(record.clone()).validate().unwrap_err();
        assert!(err.to_string().contains("not contiguous"));

        let mut drift = wallet_v1().into_v2();
        if let WalletAccount::SingleSig(account) = &mut drift.accounts[0] {
            account.external_index = 5;
        }
        let err = StoredWallet::V2(drift).validate().unwrap_err();
        assert!(err.to_string().contains("counter"));
    }

    #[test]
    fn test_rejects_inconsistent_change_flag() {
        let mut record = wallet_v1().into_v2();
        if let WalletAccount::SingleSig(account) = &mut record.accounts[0] {
            account.addresses[0].derivation_path = "m/84'/1'/0'/1/0".to_string();
        }
        assert!(StoredWallet::V2(record).validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_account_index() {
        let mut record = wallet_v1().into_v2();
        record.accounts.push(WalletAccount::SingleSig(account(0, 0, 0)));
        let err = StoredWallet::V2(record).validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_rejects_empty_ciphertext() {
        let mut record = wallet_v1().into_v2();
        record.encrypted_seed.ciphertext.clear();
        assert!(StoredWallet::V2(record).validate().is_err());
    }

    #[test]
    fn test_imported_key_must_match_account() {
        let mut record = wallet_v1().into_v2();
        record.imported_keys.insert(
            0,
            ImportedKey {
                blob: blob(),
                key_type: KeyType::Seed,
            },
        );
        assert!(StoredWallet::V2(record.clone()).validate().is_err());

        let mut imported = account(1, 1, 0);
        imported.import_type = ImportType::Seed;
        record.imported_keys.clear();
        record.accounts.push(WalletAccount::SingleSig(imported));

        record.imported_keys.insert(
            1,
            ImportedKey {
                blob: blob(),
                key_type: KeyType::Seed,
            },
        );
        StoredWallet::V2(record.clone()).validate().unwrap();

        let value = StoredWallet::V2(record).to_value().unwrap();
        assert_eq!(value["importedKeys"]["1"]["keyType"], "seed");
        assert!(value["importedKeys"]["1"]["salt"].is_string());
    }

    #[test]
    fn test_pending_tx_needs_multisig_account() {
        let mut record = wallet_v1().into_v2();
        record
            .pending_multisig_txs
            .push(PendingMultisigTx::new(0, "cHNidP8BAA=="));
        let err = StoredWallet::V2(record).validate().unwrap_err();
        assert!(err.to_string().contains("multisig"));
    }

    #[test]
    fn test_next_account_index_fills_lowest_gap() {
        let mut record = wallet_v1().into_v2();
        record.accounts.push(WalletAccount::SingleSig(account(2, 0, 0)));
        assert_eq!(record.next_account_index(), 1);
    }
}
