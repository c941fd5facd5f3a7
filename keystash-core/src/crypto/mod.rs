//! Password-based encryption.
//!
//! Keys are derived with PBKDF2-HMAC-SHA256 and used with ChaCha20Poly1305
//! (256-bit key, 96-bit IV, 128-bit tag). Every seal draws a fresh IV from
//! the OS RNG, so an IV is never reused under the same key.

pub mod blob;

pub use blob::EncryptedBlob;

use crate::error::{KeystashError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const SALT_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

pub const MIN_ITERATIONS: u32 = 100_000;
pub const WALLET_ITERATIONS: u32 = 100_000;
pub const BACKUP_ITERATIONS: u32 = 600_000;

pub const ALGORITHM: &str = "ChaCha20-Poly1305";

pub type SecretBytes = Zeroizing<Vec<u8>>;
pub type SecretString = Zeroizing<String>;

/// 256-bit key derived from a password. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.bytes))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Output of a password seal: everything needed to open it again.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub salt: [u8; SALT_SIZE],
    pub iv: [u8; IV_SIZE],
    pub iterations: u32,
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Derive an encryption key from `password` using PBKDF2-HMAC-SHA256.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Result<DerivedKey> {
    if iterations < MIN_ITERATIONS {
        return Err(KeystashError::validation(format!(
            "Key derivation requires at least {} iterations, got {}",
            MIN_ITERATIONS, iterations
        )));
    }
    if salt.len() != SALT_SIZE {
        return Err(KeystashError::validation(format!(
            "Salt must be {} bytes, got {}",
            SALT_SIZE,
            salt.len()
        )));
    }

    let mut key = DerivedKey {
        bytes: [0u8; KEY_SIZE],
    };
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key.bytes);
    Ok(key)
}

/// Encrypt with a freshly salted password key.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Sealed> {
    encrypt_with_iterations(plaintext, password, WALLET_ITERATIONS)
}

pub fn encrypt_with_iterations(plaintext: &[u8], password: &str, iterations: u32) -> Result<Sealed> {
    let salt = generate_salt();
    let key = derive_key(password, &salt, iterations)?;
    let (ciphertext, iv) = encrypt_with_key(&key, plaintext)?;

    Ok(Sealed {
        ciphertext,
        salt,
        iv,
        iterations,
    })
}

/// Decrypt a password seal. Wrong password, tampering and corruption all
/// produce [`KeystashError::Authentication`].
pub fn decrypt(
    ciphertext: &[u8],
    password: &str,
    salt: &[u8],
    iv: &[u8],
    iterations: u32,
) -> Result<SecretBytes> {
    check_iv(iv)?;
    let key = derive_key(password, salt, iterations)?;
    decrypt_with_key(&key, ciphertext, iv)
}

/// Seal `plaintext` under an already-derived key with a fresh IV.
pub fn encrypt_with_key(key: &DerivedKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; IV_SIZE])> {
    let iv = generate_iv();
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| KeystashError::internal(format!("Encryption failed: {}", e)))?;
    Ok((ciphertext, iv))
}

pub fn decrypt_with_key(key: &DerivedKey, ciphertext: &[u8], iv: &[u8]) -> Result<SecretBytes> {
    check_iv(iv)?;
    key.cipher()
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| KeystashError::Authentication)
}

/// Hex-encoded SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn check_iv(iv: &[u8]) -> Result<()> {
    if iv.len() != IV_SIZE {
        return Err(KeystashError::validation(format!(
            "IV must be {} bytes, got {}",
            IV_SIZE,
            iv.len()
        )));
    }
    Ok(())
}
