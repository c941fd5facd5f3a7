use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeystashError>;

/// Shared by every failure that could tell a wrong password apart from
/// tampered or corrupted data.
pub const DECRYPTION_FAILED: &str = "Unable to decrypt: incorrect password or corrupted data";

#[derive(Error, Debug)]
pub enum KeystashError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{}", DECRYPTION_FAILED)]
    Authentication,

    #[error("{}", DECRYPTION_FAILED)]
    Integrity,

    #[error("Unsupported version {found} (highest supported is {supported})")]
    Version { found: u32, supported: u32 },

    #[error("Wallet record is version {version}; run the migration first")]
    MigrationRequired { version: u32 },

    #[error("Network mismatch: expected {expected}, found {found}")]
    NetworkMismatch { expected: String, found: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("No wallet found")]
    WalletNotFound,

    #[error("A wallet already exists")]
    WalletExists,

    #[error("Account not found: {index}")]
    AccountNotFound { index: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeystashError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    pub fn network_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        Self::NetworkMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// True for wrong-password and tamper failures alike.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, Self::Authentication | Self::Integrity)
    }
}

impl From<bitcoin::bip32::Error> for KeystashError {
    fn from(err: bitcoin::bip32::Error) -> Self {
        KeystashError::Validation(format!("Key derivation failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_failures_share_message() {
        assert_eq!(
            KeystashError::Authentication.to_string(),
            KeystashError::Integrity.to_string()
        );
        assert!(KeystashError::Integrity.is_decryption_failure());
        assert!(!KeystashError::validation("bad").is_decryption_failure());
    }
}
