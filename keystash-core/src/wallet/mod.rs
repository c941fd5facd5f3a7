pub mod account;
pub mod config;
pub mod manager;

pub use config::WalletSettings;
pub use manager::WalletManager;
