use super::{address_table, confirm, prompt_new_password, prompt_password};
use crate::config::CliConfig;
use anyhow::Context;
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::Password;
use keystash_core::types::ImportType;
use keystash_core::{AddressType, Branch, WalletAccount, WalletManager};

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Create a new wallet with a fresh recovery phrase
    Create,
    /// Import a wallet from a recovery phrase
    Import {
        /// Mnemonic phrase (will prompt if not provided)
        #[arg(short, long)]
        mnemonic: Option<String>,
    },
    /// Show wallet information
    Info {
        /// Print the stored record as JSON (secrets stay encrypted)
        #[arg(long)]
        json: bool,
    },
    /// List the addresses of an account
    Addresses {
        /// Account index
        #[arg(short, long, default_value_t = 0)]
        account: u32,
    },
    /// Derive the next address of an account
    NewAddress {
        /// Account index
        #[arg(short, long, default_value_t = 0)]
        account: u32,
        /// Derive a change address instead of a receive address
        #[arg(short, long)]
        change: bool,
    },
    /// Flag an address as used
    MarkUsed {
        /// Account index
        #[arg(short, long, default_value_t = 0)]
        account: u32,
        address: String,
    },
    /// Add an HD account derived from the wallet seed
    NewAccount {
        name: String,
        /// Address type (legacy, segwit, native-segwit)
        #[arg(short = 't', long, default_value = "native-segwit")]
        address_type: AddressType,
    },
    /// Import a single WIF private key as its own account
    ImportKey {
        name: String,
        /// Address type (legacy, segwit, native-segwit)
        #[arg(short = 't', long, default_value = "native-segwit")]
        address_type: AddressType,
    },
    /// Import a second recovery phrase as its own account
    ImportSeed {
        name: String,
        /// Address type (legacy, segwit, native-segwit)
        #[arg(short = 't', long, default_value = "native-segwit")]
        address_type: AddressType,
    },
    /// Show the account-level extended public key
    Xpub {
        /// Account index
        #[arg(short, long, default_value_t = 0)]
        account: u32,
    },
    /// Re-encrypt the wallet under a new password
    ChangePassword,
    /// Upgrade an old wallet record
    Migrate {
        /// Restore the record saved before the last migration
        #[arg(long)]
        rollback: bool,
    },
    /// Delete the wallet
    Delete {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn handle_wallet_command(
    cmd: WalletCommands,
    manager: &WalletManager,
    config: &CliConfig,
) -> anyhow::Result<()> {
    match cmd {
        WalletCommands::Create => {
            let password = prompt_new_password("Choose a wallet password")?;

            println!("Creating {} wallet...", config.default_network);
            let (record, mnemonic) = manager
                .create_wallet(&password, config.default_network)
                .await?;

            println!("Wallet created successfully!");
            println!();
            println!("IMPORTANT: Write down your recovery phrase and keep it offline!");
            println!("Mnemonic: {}", mnemonic.as_str());
            println!();
            if let Some(first) = record.accounts.first().and_then(|a| a.addresses().first()) {
                println!("First receive address: {}", first.address);
            }
        }

        WalletCommands::Import { mnemonic } => {
            let mnemonic = match mnemonic {
                Some(m) => m,
                None => Password::new()
                    .with_prompt("Enter mnemonic phrase")
                    .interact()
                    .context("Failed to read mnemonic")?,
            };
            let password = prompt_new_password("Choose a wallet password")?;

            println!("Importing {} wallet...", config.default_network);
            let record = manager
                .import_wallet(&mnemonic, &password, config.default_network)
                .await?;

            println!("Wallet imported successfully!");
            if let Some(first) = record.accounts.first().and_then(|a| a.addresses().first()) {
                println!("First receive address: {}", first.address);
            }
        }

        WalletCommands::Info { json } => {
            let wallet = manager.wallet().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&wallet.to_value()?)?);
                return Ok(());
            }

            let settings = wallet.settings();
            println!("Wallet Information:");
            println!("  Record version: {}", wallet.version());
            println!("  Network: {}", settings.network);
            println!("  Auto-lock: {} minutes", settings.auto_lock_minutes);
            println!("  Imported keys: {}", wallet.imported_key_count());
            println!();

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Index", "Name", "Kind", "Script", "Receive", "Change"]);

            for account in wallet.accounts() {
                let (kind, script) = match &account {
                    WalletAccount::SingleSig(single) => (
                        import_label(single.import_type).to_string(),
                        single.address_type.to_string(),
                    ),
                    WalletAccount::Multisig(multi) => {
                        (format!("multisig {}", multi.config), multi.address_type.to_string())
                    }
                };
                table.add_row(vec![
                    account.index().to_string(),
                    account.name().to_string(),
                    kind,
                    script,
                    account.counter(Branch::External).to_string(),
                    account.counter(Branch::Internal).to_string(),
                ]);
            }

            println!("{}", table);
        }

        WalletCommands::Addresses { account } => {
            let wallet = manager.wallet().await?;
            let current = wallet.as_current()?;
            let account = current.account(account)?;

            println!("Addresses for account {} ({}):", account.index(), account.name());
            println!("{}", address_table(account.addresses()));
        }

        WalletCommands::NewAddress { account, change } => {
            let branch = Branch::from_is_change(change);
            let wallet = manager.wallet().await?;

            let record = if wallet.as_current()?.account(account)?.is_multisig() {
                manager.next_multisig_address(account, branch).await?
            } else {
                let password = prompt_password("Enter wallet password")?;
                manager.next_address(&password, account, branch).await?
            };

            println!("Address: {}", record.address);
            println!("Path: {}", record.derivation_path);
            if let Some(script) = record.witness_script.as_ref().or(record.redeem_script.as_ref()) {
                println!("Script: {}", script);
            }
        }

        WalletCommands::MarkUsed { account, address } => {
            if manager.mark_address_used(account, &address).await? {
                println!("Marked {} as used.", address);
            } else {
                println!("{} was already marked as used.", address);
            }
        }

        WalletCommands::NewAccount { name, address_type } => {
            let password = prompt_password("Enter wallet password")?;
            let account = manager.create_account(&password, &name, address_type).await?;

            println!("Created account {} ({}).", account.index, account.name);
            if let Some(first) = account.addresses.first() {
                println!("First receive address: {}", first.address);
            }
        }

        WalletCommands::ImportKey { name, address_type } => {
            let wif = Password::new()
                .with_prompt("Enter WIF private key")
                .interact()
                .context("Failed to read private key")?;
            let password = prompt_password("Enter wallet password")?;
            let account = manager
                .import_private_key(&password, &name, &wif, address_type)
                .await?;

            println!("Imported key as account {} ({}).", account.index, account.name);
            if let Some(first) = account.addresses.first() {
                println!("Address: {}", first.address);
            }
        }

        WalletCommands::ImportSeed { name, address_type } => {
            let mnemonic = Password::new()
                .with_prompt("Enter mnemonic phrase")
                .interact()
                .context("Failed to read mnemonic")?;
            let password = prompt_password("Enter wallet password")?;
            let account = manager
                .import_seed_account(&password, &name, &mnemonic, address_type)
                .await?;

            println!("Imported seed as account {} ({}).", account.index, account.name);
            if let Some(first) = account.addresses.first() {
                println!("First receive address: {}", first.address);
            }
        }

        WalletCommands::Xpub { account } => {
            let password = prompt_password("Enter wallet password")?;
            let xpub = manager.export_account_xpub(&password, account).await?;
            println!("{}", xpub);
        }

        WalletCommands::ChangePassword => {
            let old_password = prompt_password("Enter current wallet password")?;
            let new_password = prompt_new_password("Choose a new wallet password")?;

            manager.change_password(&old_password, &new_password).await?;
            println!("Password changed.");
        }

        WalletCommands::Migrate { rollback } => {
            if rollback {
                manager.rollback_migration().await?;
                println!("Restored the wallet record saved before migration.");
            } else if manager.migrate().await? {
                println!("Wallet record upgraded. The previous record is kept for rollback.");
            } else {
                println!("Wallet record is already current.");
            }
        }

        WalletCommands::Delete { force } => {
            if !force {
                let confirmed = confirm(
                    "Are you sure you want to delete the wallet? Without the recovery phrase or a backup the funds are lost.".to_string(),
                )?;

                if !confirmed {
                    println!("Deletion cancelled.");
                    return Ok(());
                }
            }

            manager.delete_wallet().await?;
            println!("Wallet deleted.");
        }
    }

    Ok(())
}

fn import_label(import_type: ImportType) -> &'static str {
    match import_type {
        ImportType::Hd => "hd",
        ImportType::PrivateKey => "private key",
        ImportType::Seed => "imported seed",
    }
}
