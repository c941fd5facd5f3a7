//! Multisig account construction on the BIP48 path.
//!
//! Cosigner keys are exchanged as account-level extended public keys at
//! `m/48'/coin'/account'/script'`. Addresses derive `/{change}/{index}`
//! from every cosigner key and hand the set to [`generate_multisig_address`],
//! which sorts it. The stored cosigner order is never trusted for scripts.

pub mod script;

pub use script::{
    build_multisig_script, generate_multisig_address, sort_public_keys, MultisigAddress,
};

use crate::error::{KeystashError, Result};
use crate::keys::derivation::{hardened, normal};
use crate::keys::{derive_path, format_path, parse_path, KeyNode};
use crate::types::{
    AddressRecord, Branch, Cosigner, MultisigAccount, MultisigAddressType, MultisigConfig,
    WalletNetwork,
};
use bitcoin::base58;
use bitcoin::bip32::{DerivationPath, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::CompressedPublicKey;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::debug;

pub const MULTISIG_PURPOSE: u32 = 48;

const ENCODED_XKEY_LEN: usize = 78;

const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];

/// xpub, ypub, zpub, Ypub, Zpub.
const MAINNET_PUBLIC: [[u8; 4]; 5] = [
    XPUB_VERSION,
    [0x04, 0x9d, 0x7c, 0xb2],
    [0x04, 0xb2, 0x47, 0x46],
    [0x02, 0x95, 0xb4, 0x3f],
    [0x02, 0xaa, 0x7e, 0xd3],
];

/// tpub, upub, vpub, Upub, Vpub.
const TESTNET_PUBLIC: [[u8; 4]; 5] = [
    TPUB_VERSION,
    [0x04, 0x4a, 0x52, 0x62],
    [0x04, 0x5f, 0x1c, 0xf6],
    [0x02, 0x42, 0x89, 0xef],
    [0x02, 0x57, 0x54, 0x83],
];

/// xprv, yprv, zprv, Yprv, Zprv, tprv, uprv, vprv, Uprv, Vprv.
const PRIVATE_VERSIONS: [[u8; 4]; 10] = [
    [0x04, 0x88, 0xad, 0xe4],
    [0x04, 0x9d, 0x78, 0x78],
    [0x04, 0xb2, 0x43, 0x0c],
    [0x02, 0x95, 0xb0, 0x05],
    [0x02, 0xaa, 0x7a, 0x99],
    [0x04, 0x35, 0x83, 0x94],
    [0x04, 0x4a, 0x4e, 0x28],
    [0x04, 0x5f, 0x18, 0xbc],
    [0x02, 0x42, 0x85, 0xb5],
    [0x02, 0x57, 0x50, 0x48],
];

/// Parse an extended public key for `network`, accepting SLIP-132 variants.
pub fn parse_xpub(text: &str, network: WalletNetwork) -> Result<Xpub> {
    let text = text.trim();
    let mut data = base58::decode_check(text).map_err(|_| {
        KeystashError::validation(format!("'{}' is not a valid extended public key", abbreviate(text)))
    })?;
    if data.len() != ENCODED_XKEY_LEN {
        return Err(KeystashError::validation(format!(
            "Extended key must be {} bytes, got {}",
            ENCODED_XKEY_LEN,
            data.len()
        )));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&data[..4]);
    if PRIVATE_VERSIONS.contains(&version) {
        return Err(KeystashError::validation(
            "Extended key must be public (xpub/tpub), not private",
        ));
    }

    let (key_network, canonical) = if MAINNET_PUBLIC.contains(&version) {
        (WalletNetwork::Mainnet, XPUB_VERSION)
    } else if TESTNET_PUBLIC.contains(&version) {
        (WalletNetwork::Testnet, TPUB_VERSION)
    } else {
        return Err(KeystashError::validation(format!(
            "Unknown extended key version {}",
            hex::encode(version)
        )));
    };
    if key_network != network {
        return Err(KeystashError::network_mismatch(network, key_network));
    }

    data[..4].copy_from_slice(&canonical);
    Xpub::decode(&data)
        .map_err(|e| KeystashError::validation(format!("Invalid extended public key: {}", e)))
}

/// Canonical `xpub`/`tpub` string for storage.
pub fn normalize_xpub(text: &str, network: WalletNetwork) -> Result<String> {
    Ok(parse_xpub(text, network)?.to_string())
}

/// Accepts 8 hex characters in either case, returns them lowercased.
pub fn parse_fingerprint(text: &str) -> Result<String> {
    let text = text.trim();
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(KeystashError::validation(format!(
            "Fingerprint '{}' must be 8 hexadecimal characters",
            text
        )));
    }
    Ok(text.to_ascii_lowercase())
}

/// `m/48'/{coin}'/{account}'/{script}'`
pub fn multisig_account_path(
    network: WalletNetwork,
    account_index: u32,
    address_type: MultisigAddressType,
) -> Result<DerivationPath> {
    Ok(DerivationPath::from(vec![
        hardened(MULTISIG_PURPOSE)?,
        hardened(network.coin_type())?,
        hardened(account_index)?,
        hardened(address_type.script_type())?,
    ]))
}

/// This wallet's key material as shared with the other cosigners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCosigner {
    pub xpub: String,
    pub fingerprint: String,
    pub derivation_path: String,
}

pub fn derive_multisig_xpub(
    master: &KeyNode,
    account_index: u32,
    address_type: MultisigAddressType,
) -> Result<LocalCosigner> {
    let path = multisig_account_path(master.network(), account_index, address_type)?;
    let node = derive_path(master, &path)?;
    Ok(LocalCosigner {
        xpub: node.to_xpub().to_string(),
        fingerprint: master.fingerprint().to_string(),
        derivation_path: format_path(&path),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosignerInput {
    pub name: String,
    pub xpub: String,
    pub fingerprint: String,
    /// Defaults to the account's shared BIP48 path.
    pub derivation_path: Option<String>,
}

/// Validate and assemble a multisig account. Nothing is derived or stored
/// unless every key checks out.
pub fn create_multisig_account(
    name: &str,
    config: MultisigConfig,
    address_type: MultisigAddressType,
    account_index: u32,
    local: &LocalCosigner,
    cosigners: &[CosignerInput],
) -> Result<MultisigAccount> {
    let name = name.trim();
    if name.is_empty() {
        return Err(KeystashError::validation("Account name cannot be empty"));
    }

    let expected = config.n() as usize - 1;
    if cosigners.len() != expected {
        return Err(KeystashError::validation(format!(
            "A {} account needs {} other cosigners, got {}",
            config,
            expected,
            cosigners.len()
        )));
    }

    let local_xpub = Xpub::from_str(local.xpub.trim())
        .map_err(|e| KeystashError::validation(format!("Invalid local extended key: {}", e)))?;
    let network = WalletNetwork::from(local_xpub.network);
    let shared_path = format_path(&multisig_account_path(network, account_index, address_type)?);

    let mut seen = HashSet::new();
    let mut all = Vec::with_capacity(config.n() as usize);

    let local_xpub = normalize_xpub(&local.xpub, network)?;
    seen.insert(local_xpub.clone());
    all.push(Cosigner {
        name: "This wallet".to_string(),
        xpub: local_xpub,
        fingerprint: parse_fingerprint(&local.fingerprint)?,
        derivation_path: shared_path.clone(),
        is_self: true,
    });

    for (position, input) in cosigners.iter().enumerate() {
        let cosigner_name = input.name.trim();
        if cosigner_name.is_empty() {
            return Err(KeystashError::validation(format!(
                "Cosigner {} has no name",
                position + 1
            )));
        }

        let xpub = normalize_xpub(&input.xpub, network).map_err(|e| match e {
            KeystashError::Validation(msg) => {
                KeystashError::validation(format!("Cosigner '{}': {}", cosigner_name, msg))
            }
            other => other,
        })?;
        if !seen.insert(xpub.clone()) {
            return Err(KeystashError::validation(format!(
                "Cosigner '{}' repeats an extended public key already in this account",
                cosigner_name
            )));
        }

        let derivation_path = match input.derivation_path.as_deref() {
            Some(path) if !path.trim().is_empty() => format_path(&parse_path(path)?),
            _ => shared_path.clone(),
        };

        all.push(Cosigner {
            name: cosigner_name.to_string(),
            xpub,
            fingerprint: parse_fingerprint(&input.fingerprint)?,
            derivation_path,
            is_self: false,
        });
    }

    let account = MultisigAccount {
        index: account_index,
        name: name.to_string(),
        config,
        address_type,
        cosigners: all,
        external_index: 0,
        internal_index: 0,
        addresses: Vec::new(),
    };

    // Building the first script proves every key derives and the set is usable.
    multisig_address_at(&account, Branch::External, 0)?;
    Ok(account)
}

/// Child keys `/{change}/{index}` of every cosigner, in storage order.
pub fn derive_cosigner_keys(
    account: &MultisigAccount,
    branch: Branch,
    index: u32,
) -> Result<Vec<CompressedPublicKey>> {
    let secp = Secp256k1::verification_only();
    let path = DerivationPath::from(vec![normal(branch.index())?, normal(index)?]);

    account
        .cosigners
        .iter()
        .map(|cosigner| {
            let xpub = Xpub::from_str(&cosigner.xpub).map_err(|e| {
                KeystashError::validation(format!(
                    "Stored key for cosigner '{}' is invalid: {}",
                    cosigner.name, e
                ))
            })?;
            let child = xpub.derive_pub(&secp, &path)?;
            Ok(child.to_pub())
        })
        .collect()
}

pub fn account_network(account: &MultisigAccount) -> Result<WalletNetwork> {
    let first = account
        .cosigners
        .first()
        .ok_or_else(|| KeystashError::validation("Multisig account has no cosigners"))?;
    let xpub = Xpub::from_str(&first.xpub)
        .map_err(|e| KeystashError::validation(format!("Invalid stored extended key: {}", e)))?;
    Ok(WalletNetwork::from(xpub.network))
}

pub fn multisig_address_at(
    account: &MultisigAccount,
    branch: Branch,
    index: u32,
) -> Result<MultisigAddress> {
    let keys = derive_cosigner_keys(account, branch, index)?;
    generate_multisig_address(
        &keys,
        account.config.m() as usize,
        account.address_type,
        account_network(account)?,
    )
}

/// Address record for `/{change}/{index}` below the local cosigner's path.
pub fn multisig_address_record(
    account: &MultisigAccount,
    branch: Branch,
    index: u32,
) -> Result<AddressRecord> {
    let generated = multisig_address_at(account, branch, index)?;
    let base = account
        .cosigners
        .iter()
        .find(|c| c.is_self)
        .or_else(|| account.cosigners.first())
        .map(|c| c.derivation_path.clone())
        .unwrap_or_default();

    debug!(
        "Derived multisig address {} for account {} at {}/{}",
        generated.address,
        account.index,
        branch.index(),
        index
    );

    Ok(AddressRecord {
        address: generated.address.clone(),
        derivation_path: format!("{}/{}/{}", base, branch.index(), index),
        index,
        is_change: branch.is_change(),
        used: false,
        redeem_script: generated.redeem_script_hex(),
        witness_script: generated.witness_script_hex(),
    })
}

fn abbreviate(text: &str) -> String {
    if text.chars().count() <= 16 {
        text.to_string()
    } else {
        let head: String = text.chars().take(12).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    // m/48'/1'/0'/2' of the abandon/legal/letter BIP39 test mnemonics.
    pub const XPUB_73C5DA0A: &str = "tpubDFH9dgzveyD8zTbPUFuLrGmCydNvxehyNdUXKJAQN8x4aZ4j6UZqGfnqFrD4NqyaTVGKbvEW54tsvPTK2UoSbCC1PJY8iCNiwTL3RWZEheQ";
    pub const XPUB_B8688DF1: &str = "tpubDEfobrrtptRTbKf4gysDhoabneABDTAcdj3Vbn4XwPsLE2pmqpizSPRG6zHsbAMuiSgWmWPsYCLHTKTPpyrGJ5rAoTpKoQNZcxodiPf2tSJ";
    pub const XPUB_28645006: &str = "tpubDEwqCvJxKwKWX9xvRe48uofWJn1Y89Jn8UeH1Efrjb1UEVjUDy3URYTiqWaVCW7WdvHrL8XrSihHEhTwv5H3VDJoakjuCHiAnr6xcF2Xm4s";
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::keys::{mnemonic_to_seed, new_master_key, TEST_MNEMONIC};

    const VPUB_73C5DA0A: &str = "Vpub5n95dMZrDHj6SeBgJ1oz4Fae2N2eJNuWK3VTKDb2dzGpMFLUHLmtyDfen7AaQxwQ5mZnMyXdVrkEaoMLVTH8FmVBRVWPGFYWhmtDUGehGmq";
    const TPRV_73C5DA0A: &str = "tprv8ib7VGxgWbXU6zZbacEkSs76QbrzoKX4oKsk2n86ws9fk4oxU5kF6BAy5iKYC2XM3X9GZApZM9B14B7JTXd77DXwmmNfh5cEWiw21CfyfPx";
    const MAINNET_XPUB: &str = "xpub6DkFAXWQ2dHxq2vatrt9qyA3bXYU4ToWQwCHbf5XB2mSTexcHZCeKS1VZYcPoBd5X8yVcbXFHJR9R8UCVpt82VX1VhR28mCyxUFL4r6KFrf";

    fn local() -> LocalCosigner {
        let seed = mnemonic_to_seed(TEST_MNEMONIC, "").unwrap();
        let master = new_master_key(seed.as_bytes(), WalletNetwork::Testnet).unwrap();
        derive_multisig_xpub(&master, 0, MultisigAddressType::P2wsh).unwrap()
    }

    fn others() -> Vec<CosignerInput> {
        vec![
            CosignerInput {
                name: "Alice".to_string(),
                xpub: XPUB_B8688DF1.to_string(),
                fingerprint: "B8688DF1".to_string(),
                derivation_path: None,
            },
            CosignerInput {
                name: "Bob".to_string(),
                xpub: XPUB_28645006.to_string(),
                fingerprint: "28645006".to_string(),
                derivation_path: Some("m/48h/1h/0h/2h".to_string()),
            },
        ]
    }

    #[test]
    fn test_local_cosigner_key() {
        let local = local();
        assert_eq!(local.xpub, XPUB_73C5DA0A);
        assert_eq!(local.fingerprint, "73c5da0a");
        assert_eq!(local.derivation_path, "m/48'/1'/0'/2'");
    }

    #[test]
    fn test_fixed_vector_2_of_3_p2wsh() {
        let config: MultisigConfig = "2-of-3".parse().unwrap();
        let account =
            create_multisig_account("Vault", config, MultisigAddressType::P2wsh, 0, &local(), &others())
                .unwrap();

        assert_eq!(account.cosigners.len(), 3);
        assert!(account.cosigners[0].is_self);
        assert_eq!(account.cosigners[1].fingerprint, "b8688df1");
        assert_eq!(account.cosigners[2].derivation_path, "m/48'/1'/0'/2'");

        let record = multisig_address_record(&account, Branch::External, 0).unwrap();
        assert_eq!(
            record.address,
            "tb1qr3az57pxl8z7q6d9q7v0fmeaphuwe3z0ghvkjr457ch4vqwmtkasmn0gme"
        );
        assert_eq!(record.derivation_path, "m/48'/1'/0'/2'/0/0");
        assert!(record.redeem_script.is_none());

        let generated = multisig_address_at(&account, Branch::External, 0).unwrap();
        assert_eq!(
            generated.witness_script_hash().unwrap(),
            "1c7a2a7826f9c5e069a50798f4ef3d0df8ecc44f45d9690eb4f62f5601db5dbb"
        );

        let second = multisig_address_record(&account, Branch::External, 1).unwrap();
        assert_eq!(
            second.address,
            "tb1qfd7fatk9l5q75yqft27jsn4uehtkl4eyhalgusnccwtcha362ywskv2che"
        );

        let change = multisig_address_record(&account, Branch::Internal, 0).unwrap();
        assert!(change.is_change);
        assert_eq!(
            change.address,
            "tb1qklaygzf7d5waqjvl2lul2aafh429l2xkqkrszfj537ejzmhu8axsgpufdm"
        );
    }

    #[test]
    fn test_cosigner_order_does_not_change_addresses() {
        let config: MultisigConfig = "2-of-3".parse().unwrap();
        let account =
            create_multisig_account("Vault", config, MultisigAddressType::P2wsh, 0, &local(), &others())
                .unwrap();

        let mut reordered = account.clone();
        reordered.cosigners.reverse();
        for index in 0..3 {
            for branch in [Branch::External, Branch::Internal] {
                assert_eq!(
                    multisig_address_at(&account, branch, index).unwrap(),
                    multisig_address_at(&reordered, branch, index).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_slip132_keys_are_normalized() {
        assert_eq!(
            normalize_xpub(VPUB_73C5DA0A, WalletNetwork::Testnet).unwrap(),
            XPUB_73C5DA0A
        );
        assert_eq!(
            normalize_xpub(XPUB_73C5DA0A, WalletNetwork::Testnet).unwrap(),
            XPUB_73C5DA0A
        );
    }

    #[test]
    fn test_rejects_private_and_foreign_keys() {
        let err = parse_xpub(TPRV_73C5DA0A, WalletNetwork::Testnet).unwrap_err();
        assert!(err.to_string().contains("must be public"));

        let err = parse_xpub(MAINNET_XPUB, WalletNetwork::Testnet).unwrap_err();
        assert!(matches!(err, KeystashError::NetworkMismatch { .. }));

        assert!(parse_xpub("tpubnotakey", WalletNetwork::Testnet).is_err());
    }

    #[test]
    fn test_cosigner_count_must_match_config() {
        let config: MultisigConfig = "2-of-4".parse().unwrap();
        let err =
            create_multisig_account("Vault", config, MultisigAddressType::P2wsh, 0, &local(), &others())
                .unwrap_err();
        assert!(err.to_string().contains("needs 3 other cosigners"));
    }

    #[test]
    fn test_rejects_duplicate_cosigner() {
        let config: MultisigConfig = "2-of-3".parse().unwrap();
        let mut cosigners = others();
        cosigners[1].xpub = VPUB_73C5DA0A.to_string();
        let err =
            create_multisig_account("Vault", config, MultisigAddressType::P2wsh, 0, &local(), &cosigners)
                .unwrap_err();
        assert!(err.to_string().contains("repeats"));
    }

    #[test]
    fn test_fingerprint_parsing() {
        assert_eq!(parse_fingerprint("73C5DA0A").unwrap(), "73c5da0a");
        assert!(parse_fingerprint("73c5da0").is_err());
        assert!(parse_fingerprint("zzzzzzzz").is_err());
    }

    #[test]
    fn test_account_paths() {
        let p2wsh = multisig_account_path(WalletNetwork::Mainnet, 3, MultisigAddressType::P2wsh).unwrap();
        assert_eq!(format_path(&p2wsh), "m/48'/0'/3'/2'");
        let p2sh = multisig_account_path(WalletNetwork::Testnet, 0, MultisigAddressType::P2shP2wsh).unwrap();
        assert_eq!(format_path(&p2sh), "m/48'/1'/0'/1'");
    }
}
