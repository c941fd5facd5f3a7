//! BIP39 mnemonics and seeds.

pub mod derivation;
pub mod wif;

pub use derivation::{
    account_path, address_path, derive_account_node, derive_address_node, derive_path,
    export_xpub, format_path, new_master_key, parse_path, single_sig_address, KeyNode,
};
pub use wif::{decode_wif, encode_wif, DecodedWif};

use crate::crypto::SecretString;
use crate::error::{KeystashError, Result};
use bip39::{Language, Mnemonic};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const SEED_LEN: usize = 64;

/// Entropy sizes accepted by [`generate_mnemonic`] (12 to 24 words).
pub const ENTROPY_BITS: [usize; 5] = [128, 160, 192, 224, 256];

/// A 64-byte BIP39 seed. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: [u8; SEED_LEN],
}

impl Seed {
    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SEED_LEN {
            return Err(KeystashError::validation(format!(
                "Seed must be {} bytes, got {}",
                SEED_LEN,
                bytes.len()
            )));
        }
        let mut seed = Self {
            bytes: [0u8; SEED_LEN],
        };
        seed.bytes.copy_from_slice(bytes);
        Ok(seed)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed").field("bytes", &"[REDACTED]").finish()
    }
}

/// Generate an English mnemonic from `entropy_bits` of OS randomness.
pub fn generate_mnemonic(entropy_bits: usize) -> Result<SecretString> {
    if !ENTROPY_BITS.contains(&entropy_bits) {
        return Err(KeystashError::validation(format!(
            "Entropy must be one of {:?} bits, got {}",
            ENTROPY_BITS, entropy_bits
        )));
    }

    let mut entropy = Zeroizing::new(vec![0u8; entropy_bits / 8]);
    OsRng.fill_bytes(&mut entropy);

    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| KeystashError::internal(format!("Failed to generate mnemonic: {}", e)))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Lowercases and collapses whitespace so pasted phrases parse.
pub fn normalize_mnemonic(words: &str) -> SecretString {
    Zeroizing::new(
        words
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

pub fn parse_mnemonic(words: &str) -> Result<Mnemonic> {
    let normalized = normalize_mnemonic(words);
    Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|e| KeystashError::validation(format!("Invalid mnemonic: {}", e)))
}

/// Dictionary membership and checksum check.
pub fn validate_mnemonic(words: &str) -> bool {
    parse_mnemonic(words).is_ok()
}

pub fn mnemonic_to_seed(words: &str, passphrase: &str) -> Result<Seed> {
    let mnemonic = parse_mnemonic(words)?;
    Ok(Seed::from_bytes(mnemonic.to_seed(passphrase)))
}

#[cfg(test)]
pub(crate) const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
