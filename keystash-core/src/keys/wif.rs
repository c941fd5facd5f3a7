//! Wallet Import Format.
//!
//! `version || key[32] || 0x01?` followed by a 4-byte double-SHA256
//! checksum, Base58Check encoded. 37 bytes decoded for uncompressed keys,
//! 38 for compressed ones.

use crate::crypto::SecretString;
use crate::error::{KeystashError, Result};
use crate::types::WalletNetwork;
use bitcoin::base58;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::CompressedPublicKey;
use std::fmt;
use zeroize::Zeroizing;

const MAINNET_VERSION: u8 = 0x80;
const TESTNET_VERSION: u8 = 0xef;
const COMPRESSED_FLAG: u8 = 0x01;

fn version_byte(network: WalletNetwork) -> u8 {
    match network {
        WalletNetwork::Mainnet => MAINNET_VERSION,
        WalletNetwork::Testnet => TESTNET_VERSION,
    }
}

pub struct DecodedWif {
    pub secret_key: SecretKey,
    pub network: WalletNetwork,
    pub compressed: bool,
}

impl DecodedWif {
    pub fn public_key(&self) -> CompressedPublicKey {
        let secp = Secp256k1::new();
        CompressedPublicKey(self.secret_key.public_key(&secp))
    }
}

impl fmt::Debug for DecodedWif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedWif")
            .field("secret_key", &"[REDACTED]")
            .field("network", &self.network)
            .field("compressed", &self.compressed)
            .finish()
    }
}

pub fn encode_wif(secret_key: &SecretKey, network: WalletNetwork, compressed: bool) -> SecretString {
    let mut payload = Zeroizing::new(Vec::with_capacity(34));
    payload.push(version_byte(network));
    payload.extend_from_slice(&secret_key.secret_bytes());
    if compressed {
        payload.push(COMPRESSED_FLAG);
    }
    Zeroizing::new(base58::encode_check(&payload))
}

/// Decode `wif`, requiring it to belong to `expected`.
pub fn decode_wif(wif: &str, expected: WalletNetwork) -> Result<DecodedWif> {
    let payload = Zeroizing::new(
        base58::decode_check(wif.trim())
            .map_err(|e| KeystashError::validation(format!("Invalid WIF encoding: {}", e)))?,
    );

    // decode_check strips the checksum, leaving 33 or 34 bytes.
    let compressed = match payload.len() {
        33 => false,
        34 => {
            if payload[33] != COMPRESSED_FLAG {
                return Err(KeystashError::validation(
                    "Invalid WIF: unexpected compression flag",
                ));
            }
            true
        }
        len => {
            return Err(KeystashError::validation(format!(
                "Invalid WIF length: {} bytes",
                len + 4
            )))
        }
    };

    let network = match payload[0] {
        MAINNET_VERSION => WalletNetwork::Mainnet,
        TESTNET_VERSION => WalletNetwork::Testnet,
        other => {
            return Err(KeystashError::validation(format!(
                "Invalid WIF version byte 0x{:02x}",
                other
            )))
        }
    };
    if network != expected {
        return Err(KeystashError::network_mismatch(expected, network));
    }

    let secret_key = SecretKey::from_slice(&payload[1..33])
        .map_err(|e| KeystashError::validation(format!("Invalid private key: {}", e)))?;

    Ok(DecodedWif {
        secret_key,
        network,
        compressed,
    })
}
