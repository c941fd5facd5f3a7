use crate::error::{KeystashError, Result};
use bitcoin::NetworkKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletNetwork {
    Mainnet,
    Testnet,
}

impl WalletNetwork {
    /// BIP44 coin type.
    pub fn coin_type(self) -> u32 {
        match self {
            WalletNetwork::Mainnet => 0,
            WalletNetwork::Testnet => 1,
        }
    }

    pub fn bitcoin_network(self) -> bitcoin::Network {
        match self {
            WalletNetwork::Mainnet => bitcoin::Network::Bitcoin,
            WalletNetwork::Testnet => bitcoin::Network::Testnet,
        }
    }

    pub fn kind(self) -> NetworkKind {
        match self {
            WalletNetwork::Mainnet => NetworkKind::Main,
            WalletNetwork::Testnet => NetworkKind::Test,
        }
    }
}

impl From<NetworkKind> for WalletNetwork {
    fn from(kind: NetworkKind) -> Self {
        match kind {
            NetworkKind::Main => WalletNetwork::Mainnet,
            NetworkKind::Test => WalletNetwork::Testnet,
        }
    }
}

impl fmt::Display for WalletNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletNetwork::Mainnet => f.write_str("mainnet"),
            WalletNetwork::Testnet => f.write_str("testnet"),
        }
    }
}

impl FromStr for WalletNetwork {
    type Err = KeystashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "bitcoin" | "main" => Ok(WalletNetwork::Mainnet),
            "testnet" | "test" => Ok(WalletNetwork::Testnet),
            _ => Err(KeystashError::validation(format!(
                "Unrecognized network '{}'. Supported networks: mainnet, testnet",
                s
            ))),
        }
    }
}

/// Single-signature script family, selecting the BIP44/49/84 purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressType {
    Legacy,
    Segwit,
    NativeSegwit,
}

impl AddressType {
    pub fn purpose(self) -> u32 {
        match self {
            AddressType::Legacy => 44,
            AddressType::Segwit => 49,
            AddressType::NativeSegwit => 84,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Legacy => f.write_str("legacy"),
            AddressType::Segwit => f.write_str("segwit"),
            AddressType::NativeSegwit => f.write_str("native-segwit"),
        }
    }
}

impl FromStr for AddressType {
    type Err = KeystashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(AddressType::Legacy),
            "segwit" => Ok(AddressType::Segwit),
            "native-segwit" => Ok(AddressType::NativeSegwit),
            _ => Err(KeystashError::validation(format!(
                "Unknown address type '{}'. Expected legacy, segwit or native-segwit",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MultisigAddressType {
    #[serde(rename = "p2sh")]
    P2sh,
    #[serde(rename = "p2wsh")]
    P2wsh,
    #[serde(rename = "p2sh-p2wsh")]
    P2shP2wsh,
}

impl MultisigAddressType {
    /// BIP48 script type level: 1 for the P2SH-wrapped forms, 2 for native P2WSH.
    pub fn script_type(self) -> u32 {
        match self {
            MultisigAddressType::P2wsh => 2,
            MultisigAddressType::P2sh | MultisigAddressType::P2shP2wsh => 1,
        }
    }
}

impl fmt::Display for MultisigAddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultisigAddressType::P2sh => f.write_str("p2sh"),
            MultisigAddressType::P2wsh => f.write_str("p2wsh"),
            MultisigAddressType::P2shP2wsh => f.write_str("p2sh-p2wsh"),
        }
    }
}

impl FromStr for MultisigAddressType {
    type Err = KeystashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "p2sh" => Ok(MultisigAddressType::P2sh),
            "p2wsh" => Ok(MultisigAddressType::P2wsh),
            "p2sh-p2wsh" => Ok(MultisigAddressType::P2shP2wsh),
            _ => Err(KeystashError::validation(format!(
                "Unknown multisig address type '{}'. Expected p2sh, p2wsh or p2sh-p2wsh",
                s
            ))),
        }
    }
}

/// How an account's key material entered the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportType {
    /// Derived from the wallet's own encrypted seed.
    Hd,
    PrivateKey,
    Seed,
}

/// The `change` level of a BIP44-style path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    External,
    Internal,
}

impl Branch {
    pub fn index(self) -> u32 {
        match self {
            Branch::External => 0,
            Branch::Internal => 1,
        }
    }

    pub fn is_change(self) -> bool {
        self == Branch::Internal
    }

    pub fn from_is_change(is_change: bool) -> Self {
        if is_change {
            Branch::Internal
        } else {
            Branch::External
        }
    }
}

/// `m-of-n` threshold, serialized as the string `"m-of-n"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MultisigConfig {
    m: u8,
    n: u8,
}

impl MultisigConfig {
    pub const MIN_KEYS: u8 = 2;
    pub const MAX_KEYS: u8 = 15;

    pub fn new(m: u8, n: u8) -> Result<Self> {
        if !(Self::MIN_KEYS..=Self::MAX_KEYS).contains(&n) {
            return Err(KeystashError::validation(format!(
                "Multisig must have between {} and {} keys, got {}",
                Self::MIN_KEYS,
                Self::MAX_KEYS,
                n
            )));
        }
        if m < 1 || m > n {
            return Err(KeystashError::validation(format!(
                "Required signatures must be between 1 and {}, got {}",
                n, m
            )));
        }
        Ok(Self { m, n })
    }

    pub fn m(&self) -> u8 {
        self.m
    }

    pub fn n(&self) -> u8 {
        self.n
    }
}

impl fmt::Display for MultisigConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-of-{}", self.m, self.n)
    }
}

impl FromStr for MultisigConfig {
    type Err = KeystashError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            KeystashError::validation(format!(
                "Invalid multisig configuration '{}'. Expected the form m-of-n, e.g. 2-of-3",
                s
            ))
        };
        let (m, n) = s.trim().split_once("-of-").ok_or_else(invalid)?;
        let m = m.parse::<u8>().map_err(|_| invalid())?;
        let n = n.parse::<u8>().map_err(|_| invalid())?;
        Self::new(m, n)
    }
}

impl TryFrom<String> for MultisigConfig {
    type Error = KeystashError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MultisigConfig> for String {
    fn from(config: MultisigConfig) -> Self {
        config.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub address: String,
    pub derivation_path: String,
    pub index: u32,
    pub is_change: bool,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
}

impl AddressRecord {
    pub fn branch(&self) -> Branch {
        Branch::from_is_change(self.is_change)
    }
}

/// Single-signature account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub index: u32,
    pub name: String,
    pub address_type: AddressType,
    pub import_type: ImportType,
    pub external_index: u32,
    pub internal_index: u32,
    pub addresses: Vec<AddressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cosigner {
    pub name: String,
    pub xpub: String,
    /// Master key fingerprint, 8 lowercase hex characters.
    pub fingerprint: String,
    pub derivation_path: String,
    pub is_self: bool,
}

/// Multi-signature account. `cosigners` keeps display order only; scripts
/// are always built from BIP67-sorted keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultisigAccount {
    pub index: u32,
    pub name: String,
    pub config: MultisigConfig,
    pub address_type: MultisigAddressType,
    pub cosigners: Vec<Cosigner>,
    pub external_index: u32,
    pub internal_index: u32,
    pub addresses: Vec<AddressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "accountType", rename_all = "kebab-case")]
pub enum WalletAccount {
    SingleSig(Account),
    Multisig(MultisigAccount),
}

impl WalletAccount {
    pub fn index(&self) -> u32 {
        match self {
            WalletAccount::SingleSig(account) => account.index,
            WalletAccount::Multisig(account) => account.index,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WalletAccount::SingleSig(account) => &account.name,
            WalletAccount::Multisig(account) => &account.name,
        }
    }

    pub fn addresses(&self) -> &[AddressRecord] {
        match self {
            WalletAccount::SingleSig(account) => &account.addresses,
            WalletAccount::Multisig(account) => &account.addresses,
        }
    }

    pub fn addresses_mut(&mut self) -> &mut Vec<AddressRecord> {
        match self {
            WalletAccount::SingleSig(account) => &mut account.addresses,
            WalletAccount::Multisig(account) => &mut account.addresses,
        }
    }

    /// Addresses generated so far on `branch`.
    pub fn counter(&self, branch: Branch) -> u32 {
        let (external, internal) = match self {
            WalletAccount::SingleSig(account) => (account.external_index, account.internal_index),
            WalletAccount::Multisig(account) => (account.external_index, account.internal_index),
        };
        match branch {
            Branch::External => external,
            Branch::Internal => internal,
        }
    }

    pub fn is_multisig(&self) -> bool {
        matches!(self, WalletAccount::Multisig(_))
    }

    pub fn import_type(&self) -> ImportType {
        match self {
            WalletAccount::SingleSig(account) => account.import_type,
            WalletAccount::Multisig(_) => ImportType::Hd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multisig_config_parsing() {
        let config: MultisigConfig = "2-of-3".parse().unwrap();
        assert_eq!(config.m(), 2);
        assert_eq!(config.n(), 3);
        assert_eq!(config.to_string(), "2-of-3");

        assert!("3-of-2".parse::<MultisigConfig>().is_err());
        assert!("0-of-2".parse::<MultisigConfig>().is_err());
        assert!("1-of-1".parse::<MultisigConfig>().is_err());
        assert!("2-of-16".parse::<MultisigConfig>().is_err());
        assert!("two-of-three".parse::<MultisigConfig>().is_err());
        assert!("15-of-15".parse::<MultisigConfig>().is_ok());
    }

    #[test]
    fn test_account_json_shape() {
        let account = WalletAccount::SingleSig(Account {
            index: 0,
            name: "Main".to_string(),
            address_type: AddressType::NativeSegwit,
            import_type: ImportType::Hd,
            external_index: 0,
            internal_index: 0,
            addresses: Vec::new(),
        });

        let value = serde_json::to_value(&account).unwrap();
        assert_eq!(value["accountType"], "single-sig");
        assert_eq!(value["addressType"], "native-segwit");
        assert_eq!(value["importType"], "hd");
        assert_eq!(value["externalIndex"], 0);

        let back: WalletAccount = serde_json::from_value(value).unwrap();
        assert_eq!(back, account);
    }

    #[test]
    fn test_multisig_config_rejected_in_json() {
        let value = serde_json::json!({
            "accountType": "multisig",
            "index": 0,
            "name": "Vault",
            "config": "4-of-3",
            "addressType": "p2wsh",
            "cosigners": [],
            "externalIndex": 0,
            "internalIndex": 0,
            "addresses": []
        });
        assert!(serde_json::from_value::<WalletAccount>(value).is_err());
    }

    #[test]
    fn test_unknown_enum_rejected() {
        let value = serde_json::json!({
            "accountType": "single-sig",
            "index": 0,
            "name": "Main",
            "addressType": "taproot",
            "importType": "hd",
            "externalIndex": 0,
            "internalIndex": 0,
            "addresses": []
        });
        assert!(serde_json::from_value::<WalletAccount>(value).is_err());
    }
}
