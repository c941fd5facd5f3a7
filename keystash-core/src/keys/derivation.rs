//! BIP32 hierarchical derivation and BIP44/49/84 account paths.

use crate::error::{KeystashError, Result};
use crate::keys::SEED_LEN;
use crate::types::{AddressType, Branch, WalletNetwork};
use bitcoin::bip32::{ChainCode, ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey};
use std::fmt;

/// A BIP32 node. Only ever held for the duration of one operation.
#[derive(Clone)]
pub enum KeyNode {
    Private(Xpriv),
    Public(Xpub),
}

impl KeyNode {
    pub fn is_private(&self) -> bool {
        matches!(self, KeyNode::Private(_))
    }

    pub fn network(&self) -> WalletNetwork {
        match self {
            KeyNode::Private(xpriv) => xpriv.network.into(),
            KeyNode::Public(xpub) => xpub.network.into(),
        }
    }

    pub fn private_key(&self) -> Option<SecretKey> {
        match self {
            KeyNode::Private(xpriv) => Some(xpriv.private_key),
            KeyNode::Public(_) => None,
        }
    }

    pub fn public_key(&self) -> CompressedPublicKey {
        match self {
            KeyNode::Private(xpriv) => {
                let secp = Secp256k1::new();
                CompressedPublicKey(xpriv.private_key.public_key(&secp))
            }
            KeyNode::Public(xpub) => CompressedPublicKey(xpub.public_key),
        }
    }

    pub fn chain_code(&self) -> ChainCode {
        match self {
            KeyNode::Private(xpriv) => xpriv.chain_code,
            KeyNode::Public(xpub) => xpub.chain_code,
        }
    }

    pub fn depth(&self) -> u8 {
        match self {
            KeyNode::Private(xpriv) => xpriv.depth,
            KeyNode::Public(xpub) => xpub.depth,
        }
    }

    pub fn parent_fingerprint(&self) -> Fingerprint {
        match self {
            KeyNode::Private(xpriv) => xpriv.parent_fingerprint,
            KeyNode::Public(xpub) => xpub.parent_fingerprint,
        }
    }

    pub fn child_number(&self) -> ChildNumber {
        match self {
            KeyNode::Private(xpriv) => xpriv.child_number,
            KeyNode::Public(xpub) => xpub.child_number,
        }
    }

    /// First four bytes of HASH160 of this node's public key.
    pub fn fingerprint(&self) -> Fingerprint {
        self.to_xpub().fingerprint()
    }

    pub fn to_xpub(&self) -> Xpub {
        match self {
            KeyNode::Private(xpriv) => {
                let secp = Secp256k1::new();
                Xpub::from_priv(&secp, xpriv)
            }
            KeyNode::Public(xpub) => *xpub,
        }
    }

    /// Public-only copy of this node.
    pub fn neuter(&self) -> KeyNode {
        KeyNode::Public(self.to_xpub())
    }
}

impl fmt::Debug for KeyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyNode::Private(xpriv) => f
                .debug_struct("KeyNode::Private")
                .field("depth", &xpriv.depth)
                .field("child_number", &xpriv.child_number)
                .field("private_key", &"[REDACTED]")
                .finish(),
            KeyNode::Public(xpub) => f
                .debug_struct("KeyNode::Public")
                .field("depth", &xpub.depth)
                .field("child_number", &xpub.child_number)
                .field("xpub", &xpub.to_string())
                .finish(),
        }
    }
}

/// BIP32 master key: `HMAC-SHA512("Bitcoin seed", seed)`.
pub fn new_master_key(seed: &[u8], network: WalletNetwork) -> Result<KeyNode> {
    if seed.len() != SEED_LEN {
        return Err(KeystashError::validation(format!(
            "Seed must be {} bytes, got {}",
            SEED_LEN,
            seed.len()
        )));
    }
    let master = Xpriv::new_master(network.kind(), seed)?;
    Ok(KeyNode::Private(master))
}

/// Derive `path` relative to `node`.
pub fn derive_path(node: &KeyNode, path: &DerivationPath) -> Result<KeyNode> {
    let secp = Secp256k1::new();
    match node {
        KeyNode::Private(xpriv) => Ok(KeyNode::Private(xpriv.derive_priv(&secp, path)?)),
        KeyNode::Public(xpub) => {
            if path.as_ref().iter().any(|child| child.is_hardened()) {
                return Err(KeystashError::validation(
                    "Cannot derive a hardened child from a public-only key",
                ));
            }
            Ok(KeyNode::Public(xpub.derive_pub(&secp, path)?))
        }
    }
}

/// Parse `m/84'/0'/0'/0/5`. Hardened segments end in `'` or `h`.
pub fn parse_path(text: &str) -> Result<DerivationPath> {
    let text = text.trim();
    let mut segments = text.split('/');
    match segments.next() {
        Some("m") => {}
        _ => {
            return Err(KeystashError::validation(format!(
                "Derivation path '{}' must start with 'm'",
                text
            )))
        }
    }

    let mut children = Vec::new();
    for segment in segments {
        let (digits, hardened) = match segment
            .strip_suffix('\'')
            .or_else(|| segment.strip_suffix('h'))
        {
            Some(digits) => (digits, true),
            None => (segment, false),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeystashError::validation(format!(
                "Invalid segment '{}' in derivation path '{}'",
                segment, text
            )));
        }

        let out_of_range = || {
            KeystashError::validation(format!(
                "Index '{}' in derivation path '{}' is out of range",
                segment, text
            ))
        };
        let index: u32 = digits.parse().map_err(|_| out_of_range())?;
        let child = if hardened {
            ChildNumber::from_hardened_idx(index)
        } else {
            ChildNumber::from_normal_idx(index)
        }
        .map_err(|_| out_of_range())?;
        children.push(child);
    }

    Ok(DerivationPath::from(children))
}

/// Text form with a leading `m` and `'` hardened markers.
pub fn format_path(path: &DerivationPath) -> String {
    let mut out = String::from("m");
    for child in path.as_ref() {
        match child {
            ChildNumber::Normal { index } => out.push_str(&format!("/{}", index)),
            ChildNumber::Hardened { index } => out.push_str(&format!("/{}'", index)),
        }
    }
    out
}

pub(crate) fn hardened(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_hardened_idx(index).map_err(|_| {
        KeystashError::validation(format!("Index {} is too large for hardened derivation", index))
    })
}

pub(crate) fn normal(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_normal_idx(index)
        .map_err(|_| KeystashError::validation(format!("Index {} is out of range", index)))
}

/// `m/{44|49|84}'/{coin}'/{account}'`
pub fn account_path(
    address_type: AddressType,
    network: WalletNetwork,
    account_index: u32,
) -> Result<DerivationPath> {
    Ok(DerivationPath::from(vec![
        hardened(address_type.purpose())?,
        hardened(network.coin_type())?,
        hardened(account_index)?,
    ]))
}

/// `m/{44|49|84}'/{coin}'/{account}'/{change}/{index}`
pub fn address_path(
    address_type: AddressType,
    network: WalletNetwork,
    account_index: u32,
    branch: Branch,
    address_index: u32,
) -> Result<DerivationPath> {
    let account = account_path(address_type, network, account_index)?;
    Ok(account.extend([normal(branch.index())?, normal(address_index)?]))
}

pub fn derive_account_node(
    master: &KeyNode,
    address_type: AddressType,
    account_index: u32,
) -> Result<KeyNode> {
    let path = account_path(address_type, master.network(), account_index)?;
    derive_path(master, &path)
}

pub fn derive_address_node(
    master: &KeyNode,
    address_type: AddressType,
    account_index: u32,
    branch: Branch,
    address_index: u32,
) -> Result<KeyNode> {
    let path = address_path(
        address_type,
        master.network(),
        account_index,
        branch,
        address_index,
    )?;
    derive_path(master, &path)
}

/// Base58Check of the neutered node. Prefer account-level nodes over the master.
pub fn export_xpub(node: &KeyNode) -> String {
    node.to_xpub().to_string()
}

/// legacy → P2PKH, segwit → P2SH-P2WPKH, native-segwit → P2WPKH.
pub fn single_sig_address(
    public_key: &CompressedPublicKey,
    address_type: AddressType,
    network: WalletNetwork,
) -> String {
    let address = match address_type {
        AddressType::Legacy => Address::p2pkh(public_key.pubkey_hash(), network.kind()),
        AddressType::Segwit => Address::p2shwpkh(public_key, network.kind()),
        AddressType::NativeSegwit => Address::p2wpkh(public_key, network.bitcoin_network()),
    };
    address.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{mnemonic_to_seed, TEST_MNEMONIC};

    fn master(network: WalletNetwork) -> KeyNode {
        let seed = mnemonic_to_seed(TEST_MNEMONIC, "").unwrap();
        new_master_key(seed.as_bytes(), network).unwrap()
    }

    fn address_at(
        network: WalletNetwork,
        address_type: AddressType,
        branch: Branch,
        index: u32,
    ) -> String {
        let node = derive_address_node(&master(network), address_type, 0, branch, index).unwrap();
        single_sig_address(&node.public_key(), address_type, network)
    }

    #[test]
    fn test_native_segwit_regression_vectors() {
        use AddressType::NativeSegwit;
        use WalletNetwork::{Mainnet, Testnet};

        assert_eq!(
            address_at(Testnet, NativeSegwit, Branch::External, 0),
            "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl"
        );
        assert_eq!(
            address_at(Testnet, NativeSegwit, Branch::External, 1),
            "tb1qd7spv5q28348xl4myc8zmh983w5jx32cjhkn97"
        );
        assert_eq!(
            address_at(Testnet, NativeSegwit, Branch::Internal, 0),
            "tb1q9u62588spffmq4dzjxsr5l297znf3z6j5p2688"
        );
        assert_eq!(
            address_at(Mainnet, NativeSegwit, Branch::External, 0),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            address_at(Mainnet, NativeSegwit, Branch::Internal, 0),
            "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el"
        );
    }

    #[test]
    fn test_legacy_and_segwit_vectors() {
        use WalletNetwork::{Mainnet, Testnet};

        assert_eq!(
            address_at(Mainnet, AddressType::Legacy, Branch::External, 0),
            "1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA"
        );
        assert_eq!(
            address_at(Mainnet, AddressType::Segwit, Branch::External, 0),
            "37VucYSaXLCAsxYyAPfbSi9eh4iEcbShgf"
        );
        assert_eq!(
            address_at(Testnet, AddressType::Legacy, Branch::External, 0),
            "mkpZhYtJu2r87Js3pDiWJDmPte2NRZ8bJV"
        );
        assert_eq!(
            address_at(Testnet, AddressType::Segwit, Branch::External, 0),
            "2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2"
        );
    }

    #[test]
    fn test_master_key() {
        let node = master(WalletNetwork::Mainnet);
        assert!(node.is_private());
        assert_eq!(node.depth(), 0);
        assert_eq!(node.fingerprint().to_string(), "73c5da0a");
        assert_eq!(
            export_xpub(&node),
            "xpub661MyMwAqRbcFkPHucMnrGNzDwb6teAX1RbKQmqtEF8kK3Z7LZ59qafCjB9eCRLiTVG3uxBxgKvRgbubRhqSKXnGGb1aoaqLrpMBDrVxga8"
        );
        if let KeyNode::Private(xpriv) = &node {
            assert_eq!(
                xpriv.to_string(),
                "xprv9s21ZrQH143K3GJpoapnV8SFfukcVBSfeCficPSGfubmSFDxo1kuHnLisriDvSnRRuL2Qrg5ggqHKNVpxR86QEC8w35uxmGoggxtQTPvfUu"
            );
        }

        assert!(new_master_key(&[0u8; 32], WalletNetwork::Mainnet).is_err());
    }

    #[test]
    fn test_account_xpub_export() {
        let account = derive_account_node(
            &master(WalletNetwork::Mainnet),
            AddressType::NativeSegwit,
            0,
        )
        .unwrap();
        assert_eq!(account.depth(), 3);
        assert_eq!(account.parent_fingerprint().to_string(), "7ef32bdb");
        assert_eq!(
            export_xpub(&account),
            "xpub6CatWdiZiodmUeTDp8LT5or8nmbKNcuyvz7WyksVFkKB4RHwCD3XyuvPEbvqAQY3rAPshWcMLoP2fMFMKHPJ4ZeZXYVUhLv1VMrjPC7PW6V"
        );

        let testnet = derive_account_node(
            &master(WalletNetwork::Testnet),
            AddressType::NativeSegwit,
            0,
        )
        .unwrap();
        assert_eq!(
            export_xpub(&testnet),
            "tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M"
        );
    }

    #[test]
    fn test_public_derivation_matches_private() {
        let account = derive_account_node(
            &master(WalletNetwork::Testnet),
            AddressType::NativeSegwit,
            0,
        )
        .unwrap();
        let public = account.neuter();
        assert!(!public.is_private());
        assert!(public.private_key().is_none());

        let rel = parse_path("m/0/0").unwrap();
        let from_private = derive_path(&account, &rel).unwrap();
        let from_public = derive_path(&public, &rel).unwrap();
        assert_eq!(from_private.public_key(), from_public.public_key());
        assert_eq!(
            single_sig_address(
                &from_public.public_key(),
                AddressType::NativeSegwit,
                WalletNetwork::Testnet
            ),
            "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl"
        );
    }

    #[test]
    fn test_hardened_from_public_fails() {
        let public = master(WalletNetwork::Testnet).neuter();
        let err = derive_path(&public, &parse_path("m/0'").unwrap()).unwrap_err();
        assert!(matches!(err, KeystashError::Validation(_)));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let path = parse_path("m/84'/1'/0'/0/7").unwrap();
        let a = derive_path(&master(WalletNetwork::Testnet), &path).unwrap();
        let b = derive_path(&master(WalletNetwork::Testnet), &path).unwrap();
        assert_eq!(a.private_key(), b.private_key());
        assert_eq!(a.chain_code(), b.chain_code());
        assert_eq!(a.child_number(), ChildNumber::from_normal_idx(7).unwrap());
    }

    #[test]
    fn test_parse_and_format_path() {
        let path = parse_path("m/84'/1'/0'/0/5").unwrap();
        assert_eq!(format_path(&path), "m/84'/1'/0'/0/5");

        let path = parse_path("m/48h/0h/0h/2h").unwrap();
        assert_eq!(format_path(&path), "m/48'/0'/0'/2'");

        assert_eq!(format_path(&parse_path("m").unwrap()), "m");

        for bad in ["", "84'/0'", "m/", "m//0", "m/x", "m/-1", "m/0''", "m/2147483648", "n/0"] {
            assert!(parse_path(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_account_paths() {
        let path = address_path(
            AddressType::Segwit,
            WalletNetwork::Testnet,
            3,
            Branch::Internal,
            9,
        )
        .unwrap();
        assert_eq!(format_path(&path), "m/49'/1'/3'/1/9");

        let path = account_path(AddressType::Legacy, WalletNetwork::Mainnet, 0).unwrap();
        assert_eq!(format_path(&path), "m/44'/0'/0'");

        assert!(account_path(AddressType::Legacy, WalletNetwork::Mainnet, 1 << 31).is_err());
    }
}
