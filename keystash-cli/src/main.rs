mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::CliConfig;
use keystash_core::{KeystashError, WalletManager, WalletNetwork};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "keystash")]
#[command(about = "keystash - self-custody Bitcoin key manager")]
#[command(version)]
struct Cli {
    /// Data directory for wallet storage
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Network for new wallets (mainnet, testnet)
    #[arg(short, long, global = true)]
    network: Option<WalletNetwork>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet and account management
    #[command(subcommand)]
    Wallet(commands::WalletCommands),

    /// Multisig accounts
    #[command(subcommand)]
    Multisig(commands::MultisigCommands),

    /// Backup and restore
    #[command(subcommand)]
    Backup(commands::BackupCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::from_args(cli.data_dir, cli.network, cli.verbose);

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_filter()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Ensure data directory exists
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tracing::debug!("Using data directory {}", config.data_dir.display());

    let manager = WalletManager::open(&config.data_dir).await?;

    // Execute command
    let result = match cli.command {
        Commands::Wallet(cmd) => commands::handle_wallet_command(cmd, &manager, &config).await,
        Commands::Multisig(cmd) => commands::handle_multisig_command(cmd, &manager).await,
        Commands::Backup(cmd) => commands::handle_backup_command(cmd, &manager).await,
    };

    if let Err(e) = result {
        match e.downcast_ref::<KeystashError>() {
            Some(KeystashError::WalletNotFound) => {
                eprintln!("Error: No wallet found in {}", config.data_dir.display());
                eprintln!("Use 'keystash wallet create' or 'keystash backup restore' first");
            }
            Some(KeystashError::WalletExists) => {
                eprintln!("Error: A wallet already exists in {}", config.data_dir.display());
                eprintln!("Use 'keystash backup restore --replace' to overwrite it");
            }
            Some(KeystashError::MigrationRequired { version }) => {
                eprintln!("Error: Wallet record is version {}", version);
                eprintln!("Use 'keystash wallet migrate' to upgrade it");
            }
            Some(err) => {
                eprintln!("Error: {}", err);
            }
            None => {
                eprintln!("Error: {:#}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
