use keystash_core::WalletNetwork;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub data_dir: PathBuf,
    pub default_network: WalletNetwork,
    pub verbose: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("keystash"),
            default_network: WalletNetwork::Testnet,
            verbose: false,
        }
    }
}

impl CliConfig {
    /// Defaults overridden by whatever was given on the command line.
    pub fn from_args(data_dir: Option<PathBuf>, network: Option<WalletNetwork>, verbose: bool) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: data_dir.unwrap_or(defaults.data_dir),
            default_network: network.unwrap_or(defaults.default_network),
            verbose,
        }
    }

    pub fn log_filter(&self) -> String {
        let level = if self.verbose { "debug" } else { "info" };
        format!("keystash={}", level)
    }
}
