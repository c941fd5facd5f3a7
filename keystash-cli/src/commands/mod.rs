pub mod backup;
pub mod multisig;
pub mod wallet;

pub use backup::{handle_backup_command, BackupCommands};
pub use multisig::{handle_multisig_command, MultisigCommands};
pub use wallet::{handle_wallet_command, WalletCommands};

use anyhow::Context;
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::{Confirm, Password};
use keystash_core::AddressRecord;

pub(crate) fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    Password::new()
        .with_prompt(prompt)
        .interact()
        .context("Failed to read password")
}

/// Prompt twice for a password that is about to protect something.
pub(crate) fn prompt_new_password(prompt: &str) -> anyhow::Result<String> {
    Password::new()
        .with_prompt(prompt)
        .with_confirmation("Confirm password", "Passwords don't match")
        .interact()
        .context("Failed to read password")
}

pub(crate) fn confirm(prompt: String) -> anyhow::Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

pub(crate) fn address_table<'a>(records: impl IntoIterator<Item = &'a AddressRecord>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Index", "Branch", "Path", "Address", "Used"]);

    for record in records {
        table.add_row(vec![
            record.index.to_string(),
            if record.is_change { "change" } else { "receive" }.to_string(),
            record.derivation_path.clone(),
            record.address.clone(),
            if record.used { "yes" } else { "" }.to_string(),
        ]);
    }
    table
}
