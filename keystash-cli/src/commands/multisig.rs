use super::{address_table, prompt_password};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use keystash_core::multisig::CosignerInput;
use keystash_core::{Branch, MultisigAddressType, MultisigConfig, WalletManager};

#[derive(Subcommand)]
pub enum MultisigCommands {
    /// Show this wallet's key to share with cosigners
    Xpub {
        /// BIP48 account index
        #[arg(short, long, default_value_t = 0)]
        account: u32,
        /// Script type (p2sh, p2wsh, p2sh-p2wsh)
        #[arg(short = 't', long, default_value = "p2wsh")]
        address_type: MultisigAddressType,
    },
    /// Create a multisig account from the other cosigners' keys
    Create {
        name: String,
        /// Threshold, e.g. 2-of-3
        #[arg(short = 'q', long)]
        quorum: MultisigConfig,
        /// BIP48 account index, also used as the wallet account slot
        #[arg(short, long)]
        account: u32,
        /// Script type (p2sh, p2wsh, p2sh-p2wsh)
        #[arg(short = 't', long, default_value = "p2wsh")]
        address_type: MultisigAddressType,
        /// Cosigner as NAME:FINGERPRINT:XPUB[:PATH]; repeat for each cosigner
        #[arg(short, long = "cosigner", value_parser = parse_cosigner)]
        cosigners: Vec<CosignerInput>,
    },
    /// Derive the next address of a multisig account
    NewAddress {
        #[arg(short, long)]
        account: u32,
        /// Derive a change address instead of a receive address
        #[arg(short, long)]
        change: bool,
    },
}

pub async fn handle_multisig_command(cmd: MultisigCommands, manager: &WalletManager) -> anyhow::Result<()> {
    match cmd {
        MultisigCommands::Xpub {
            account,
            address_type,
        } => {
            let password = prompt_password("Enter wallet password")?;
            let local = manager.multisig_xpub(&password, account, address_type).await?;

            println!("Share these with your cosigners:");
            println!("  Fingerprint: {}", local.fingerprint);
            println!("  Path: {}", local.derivation_path);
            println!("  Xpub: {}", local.xpub);
        }

        MultisigCommands::Create {
            name,
            quorum,
            account,
            address_type,
            cosigners,
        } => {
            let password = prompt_password("Enter wallet password")?;
            let created = manager
                .create_multisig_account(&password, &name, quorum, address_type, account, &cosigners)
                .await?;

            println!("Created {} {} account {} ({}).", created.config, created.address_type, created.index, created.name);
            println!();

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Cosigner", "Fingerprint", "Path", "Xpub"]);
            for cosigner in &created.cosigners {
                table.add_row(vec![
                    cosigner.name.clone(),
                    cosigner.fingerprint.clone(),
                    cosigner.derivation_path.clone(),
                    cosigner.xpub.clone(),
                ]);
            }
            println!("{}", table);

            println!("Check that every cosigner sees the same first address:");
            println!("{}", address_table(&created.addresses));
        }

        MultisigCommands::NewAddress { account, change } => {
            let record = manager
                .next_multisig_address(account, Branch::from_is_change(change))
                .await?;

            println!("Address: {}", record.address);
            println!("Path: {}", record.derivation_path);
            if let Some(script) = record.witness_script.as_ref().or(record.redeem_script.as_ref()) {
                println!("Script: {}", script);
            }
        }
    }

    Ok(())
}

fn parse_cosigner(text: &str) -> Result<CosignerInput, String> {
    let parts: Vec<&str> = text.split(':').map(str::trim).collect();
    match parts.as_slice() {
        [name, fingerprint, xpub] | [name, fingerprint, xpub, ""] => Ok(CosignerInput {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            xpub: xpub.to_string(),
            derivation_path: None,
        }),
        [name, fingerprint, xpub, path] => Ok(CosignerInput {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            xpub: xpub.to_string(),
            derivation_path: Some(path.to_string()),
        }),
        _ => Err("expected NAME:FINGERPRINT:XPUB[:PATH]".to_string()),
    }
}
