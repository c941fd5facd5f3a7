use super::{DerivedKey, SecretBytes, IV_SIZE, MIN_ITERATIONS, SALT_SIZE};
use crate::error::{KeystashError, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// Ciphertext at rest, with the parameters needed to open it.
///
/// Password seals carry `salt` and `iterations`; items sealed under a
/// shared key (see [`EncryptedBlob::seal_with_key`]) carry neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    pub ciphertext: String,
    pub iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

impl EncryptedBlob {
    pub fn seal(plaintext: &[u8], password: &str) -> Result<Self> {
        let sealed = super::encrypt(plaintext, password)?;
        Ok(Self {
            ciphertext: encode(&sealed.ciphertext),
            iv: encode(&sealed.iv),
            salt: Some(encode(&sealed.salt)),
            iterations: Some(sealed.iterations),
        })
    }

    pub fn seal_with_key(key: &DerivedKey, plaintext: &[u8]) -> Result<Self> {
        let (ciphertext, iv) = super::encrypt_with_key(key, plaintext)?;
        Ok(Self {
            ciphertext: encode(&ciphertext),
            iv: encode(&iv),
            salt: None,
            iterations: None,
        })
    }

    pub fn open(&self, password: &str) -> Result<SecretBytes> {
        self.validate(true)?;
        let salt = self
            .salt
            .as_deref()
            .ok_or_else(|| KeystashError::validation("Encrypted blob has no salt"))?;
        let iterations = self
            .iterations
            .ok_or_else(|| KeystashError::validation("Encrypted blob has no iteration count"))?;

        super::decrypt(
            &decode("ciphertext", &self.ciphertext)?,
            password,
            &decode("salt", salt)?,
            &decode("iv", &self.iv)?,
            iterations,
        )
    }

    pub fn open_with_key(&self, key: &DerivedKey) -> Result<SecretBytes> {
        self.validate(false)?;
        super::decrypt_with_key(
            key,
            &decode("ciphertext", &self.ciphertext)?,
            &decode("iv", &self.iv)?,
        )
    }

    /// Structural checks only; says nothing about whether a password opens it.
    pub fn validate(&self, password_sealed: bool) -> Result<()> {
        if self.ciphertext.is_empty() {
            return Err(KeystashError::validation("Encrypted blob has empty ciphertext"));
        }
        decode("ciphertext", &self.ciphertext)?;
        expect_len("iv", &self.iv, IV_SIZE)?;

        match (&self.salt, self.iterations) {
            (Some(salt), Some(iterations)) => {
                expect_len("salt", salt, SALT_SIZE)?;
                if iterations < MIN_ITERATIONS {
                    return Err(KeystashError::validation(format!(
                        "Encrypted blob iteration count {} is below the minimum of {}",
                        iterations, MIN_ITERATIONS
                    )));
                }
            }
            (None, None) if !password_sealed => {}
            _ => {
                return Err(KeystashError::validation(
                    "Encrypted blob must carry both salt and iterations",
                ))
            }
        }
        Ok(())
    }
}

pub(crate) fn encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn decode(field: &str, text: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(text)
        .map_err(|e| KeystashError::validation(format!("Field '{}' is not valid base64: {}", field, e)))
}

pub(crate) fn expect_len(field: &str, text: &str, len: usize) -> Result<Vec<u8>> {
    let bytes = decode(field, text)?;
    if bytes.len() != len {
        return Err(KeystashError::validation(format!(
            "Field '{}' must be {} bytes, got {}",
            field,
            len,
            bytes.len()
        )));
    }
    Ok(bytes)
}
