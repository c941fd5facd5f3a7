use super::{confirm, prompt_new_password, prompt_password};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use keystash_core::{ImportOptions, WalletManager};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create encrypted backup
    Create {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Restore from encrypted backup
    Restore {
        /// Backup file path
        #[arg(short, long)]
        input: PathBuf,
        /// Replace the wallet already in the data directory
        #[arg(long)]
        replace: bool,
        /// Skip confirmation prompt when replacing
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn handle_backup_command(cmd: BackupCommands, manager: &WalletManager) -> anyhow::Result<()> {
    match cmd {
        BackupCommands::Create { output } => {
            let wallet_password = prompt_password("Enter wallet password")?;
            println!("The backup password must differ from the wallet password and be at least 12 characters.");
            let backup_password = prompt_new_password("Choose a backup password")?;

            println!("Creating encrypted backup...");
            manager
                .backups()
                .export_to_file(&output, &wallet_password, &backup_password)
                .await?;

            println!("Backup created successfully at: {}", output.display());
            println!("Keep your backup password safe - it cannot be recovered!");
        }

        BackupCommands::Restore {
            input,
            replace,
            force,
        } => {
            if replace && !force && manager.has_wallet().await? {
                let confirmed = confirm(
                    "Replace the current wallet with the backup? The current wallet is lost unless you have its recovery phrase.".to_string(),
                )?;
                if !confirmed {
                    println!("Restore cancelled.");
                    return Ok(());
                }
            }

            let backup_password = prompt_password("Enter backup password")?;

            println!("Restoring from backup...");
            let summary = manager
                .backups()
                .import_from_file(
                    &input,
                    &backup_password,
                    ImportOptions {
                        replace_existing: replace,
                    },
                )
                .await?;

            println!("Wallet restored successfully!");
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Restored", "Value"]);
            table.add_row(vec!["Network".to_string(), summary.network.to_string()]);
            table.add_row(vec!["Backup created".to_string(), summary.backup_created_at.to_rfc3339()]);
            table.add_row(vec!["Accounts".to_string(), summary.accounts.to_string()]);
            table.add_row(vec!["Multisig accounts".to_string(), summary.multisig_accounts.to_string()]);
            table.add_row(vec!["Addresses".to_string(), summary.addresses.to_string()]);
            table.add_row(vec!["Imported keys".to_string(), summary.imported_keys.to_string()]);
            table.add_row(vec!["Contacts".to_string(), summary.contacts_restored.to_string()]);
            table.add_row(vec![
                "Transaction labels".to_string(),
                summary.transaction_metadata_restored.to_string(),
            ]);
            println!("{}", table);

            for error in &summary.companion_errors {
                eprintln!("Warning: {}", error);
            }
            println!("Unlock the restored wallet with its original wallet password.");
        }
    }

    Ok(())
}
