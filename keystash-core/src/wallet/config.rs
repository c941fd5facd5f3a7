use crate::error::{KeystashError, Result};
use crate::types::WalletNetwork;
use serde::{Deserialize, Serialize};

pub const DEFAULT_AUTO_LOCK_MINUTES: u32 = 15;
pub const MAX_AUTO_LOCK_MINUTES: u32 = 24 * 60;

/// Settings persisted with the wallet record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSettings {
    pub network: WalletNetwork,
    /// Minutes of inactivity before the host drops unlocked material.
    pub auto_lock_minutes: u32,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            network: WalletNetwork::Testnet,
            auto_lock_minutes: DEFAULT_AUTO_LOCK_MINUTES,
        }
    }
}

impl WalletSettings {
    pub fn new(network: WalletNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn with_auto_lock(mut self, minutes: u32) -> Self {
        self.auto_lock_minutes = minutes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.auto_lock_minutes == 0 {
            return Err(KeystashError::config(
                "Auto-lock must be at least 1 minute",
            ));
        }

        if self.auto_lock_minutes > MAX_AUTO_LOCK_MINUTES {
            return Err(KeystashError::config(format!(
                "Auto-lock cannot exceed {} minutes",
                MAX_AUTO_LOCK_MINUTES
            )));
        }

        Ok(())
    }
}
