//! keystash - key management and encrypted storage for a self-custody
//! Bitcoin wallet.
//!
//! Turns a recovery phrase into single-sig and multisig addresses, keeps
//! every secret sealed under the wallet password, and produces portable
//! backups protected by a second, independent password.

pub mod backup;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod multisig;
pub mod storage;
pub mod types;
pub mod wallet;

pub use backup::{BackupContainer, BackupManager, BackupStage, ImportOptions, ImportSummary};
pub use error::{KeystashError, Result};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StoredWallet};
pub use types::{
    AddressRecord, AddressType, Branch, MultisigAddressType, MultisigConfig, WalletAccount,
    WalletNetwork,
};
pub use wallet::{WalletManager, WalletSettings};

pub use ::bitcoin::Network;
