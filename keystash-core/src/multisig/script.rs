//! BIP67 sorted multisig scripts and their P2SH / P2WSH / P2SH-P2WSH addresses.

use crate::error::{KeystashError, Result};
use crate::types::{MultisigAddressType, MultisigConfig, WalletNetwork};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::{Address, CompressedPublicKey, PublicKey, ScriptBuf};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigAddress {
    pub address: String,
    /// Present for p2sh and p2sh-p2wsh.
    pub redeem_script: Option<ScriptBuf>,
    /// Present for p2wsh and p2sh-p2wsh.
    pub witness_script: Option<ScriptBuf>,
}

impl MultisigAddress {
    pub fn redeem_script_hex(&self) -> Option<String> {
        self.redeem_script.as_ref().map(|s| hex::encode(s.as_bytes()))
    }

    pub fn witness_script_hex(&self) -> Option<String> {
        self.witness_script.as_ref().map(|s| hex::encode(s.as_bytes()))
    }

    /// SHA256 of the witness script, i.e. the P2WSH program.
    pub fn witness_script_hash(&self) -> Option<String> {
        self.witness_script
            .as_ref()
            .map(|s| hex::encode(s.wscript_hash().to_byte_array()))
    }
}

/// Ascending by compressed serialization (BIP67).
pub fn sort_public_keys(keys: &[CompressedPublicKey]) -> Vec<CompressedPublicKey> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|key| key.to_bytes());
    sorted
}

/// `OP_m <sorted keys> OP_n OP_CHECKMULTISIG`. Keys may arrive in any order.
pub fn build_multisig_script(m: usize, keys: &[CompressedPublicKey]) -> Result<ScriptBuf> {
    let n = keys.len();
    if !(MultisigConfig::MIN_KEYS as usize..=MultisigConfig::MAX_KEYS as usize).contains(&n) {
        return Err(KeystashError::validation(format!(
            "Multisig requires between {} and {} public keys, got {}",
            MultisigConfig::MIN_KEYS,
            MultisigConfig::MAX_KEYS,
            n
        )));
    }
    if m < 1 || m > n {
        return Err(KeystashError::validation(format!(
            "Required signatures must be between 1 and {}, got {}",
            n, m
        )));
    }

    let mut seen = HashSet::new();
    if !keys.iter().all(|key| seen.insert(key.to_bytes())) {
        return Err(KeystashError::validation(
            "Multisig public keys must be distinct",
        ));
    }

    let mut builder = Builder::new().push_int(m as i64);
    for key in sort_public_keys(keys) {
        builder = builder.push_key(&PublicKey::from(key));
    }
    Ok(builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

pub fn generate_multisig_address(
    keys: &[CompressedPublicKey],
    m: usize,
    address_type: MultisigAddressType,
    network: WalletNetwork,
) -> Result<MultisigAddress> {
    let script = build_multisig_script(m, keys)?;

    let generated = match address_type {
        MultisigAddressType::P2sh => {
            let address = Address::p2sh(&script, network.kind()).map_err(|e| {
                KeystashError::validation(format!("Cannot build P2SH address: {}", e))
            })?;
            MultisigAddress {
                address: address.to_string(),
                redeem_script: Some(script),
                witness_script: None,
            }
        }
        MultisigAddressType::P2wsh => MultisigAddress {
            address: Address::p2wsh(&script, network.bitcoin_network()).to_string(),
            redeem_script: None,
            witness_script: Some(script),
        },
        MultisigAddressType::P2shP2wsh => {
            let redeem_script = ScriptBuf::new_p2wsh(&script.wscript_hash());
            MultisigAddress {
                address: Address::p2shwsh(&script, network.kind()).to_string(),
                redeem_script: Some(redeem_script),
                witness_script: Some(script),
            }
        }
    };

    Ok(generated)
}
