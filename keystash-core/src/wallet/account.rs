//! Address bookkeeping for accounts: append-only per branch, counters
//! always equal to the number of addresses on that branch.

use crate::error::{KeystashError, Result};
use crate::keys::{address_path, derive_path, format_path, single_sig_address, KeyNode};
use crate::multisig::multisig_address_record;
use crate::types::{
    Account, AddressRecord, AddressType, Branch, ImportType, MultisigAccount, WalletAccount,
};
use tracing::info;

pub const DEFAULT_ACCOUNT_NAME: &str = "Main";

pub fn new_account(index: u32, name: &str, address_type: AddressType, import_type: ImportType) -> Result<Account> {
    let name = name.trim();
    if name.is_empty() {
        return Err(KeystashError::validation("Account name cannot be empty"));
    }
    Ok(Account {
        index,
        name: name.to_string(),
        address_type,
        import_type,
        external_index: 0,
        internal_index: 0,
        addresses: Vec::new(),
    })
}

/// Account level used in the derivation path. Imported seeds are
/// independent wallets and use their own first account.
pub fn derivation_account(account: &Account) -> u32 {
    match account.import_type {
        ImportType::Seed => 0,
        _ => account.index,
    }
}

/// Derive and append the next address on `branch`.
///
/// `master` is the wallet master key for HD accounts, or the imported
/// seed's master key for seed accounts.
pub fn next_single_sig_address(account: &mut Account, master: &KeyNode, branch: Branch) -> Result<AddressRecord> {
    if account.import_type == ImportType::PrivateKey {
        return Err(KeystashError::validation(format!(
            "Account {} holds a single imported key and cannot derive new addresses",
            account.index
        )));
    }

    let index = counter(account.external_index, account.internal_index, branch);
    let network = master.network();
    let path = address_path(
        account.address_type,
        network,
        derivation_account(account),
        branch,
        index,
    )?;
    let node = derive_path(master, &path)?;

    let record = AddressRecord {
        address: single_sig_address(&node.public_key(), account.address_type, network),
        derivation_path: format_path(&path),
        index,
        is_change: branch.is_change(),
        used: false,
        redeem_script: None,
        witness_script: None,
    };

    account.addresses.push(record.clone());
    match branch {
        Branch::External => account.external_index += 1,
        Branch::Internal => account.internal_index += 1,
    }

    info!(
        "Generated {} address {} for account {}",
        if branch.is_change() { "change" } else { "receive" },
        record.address,
        account.index
    );
    Ok(record)
}

pub fn next_multisig_address(account: &mut MultisigAccount, branch: Branch) -> Result<AddressRecord> {
    let index = counter(account.external_index, account.internal_index, branch);
    let record = multisig_address_record(account, branch, index)?;

    account.addresses.push(record.clone());
    match branch {
        Branch::External => account.external_index += 1,
        Branch::Internal => account.internal_index += 1,
    }

    info!(
        "Generated multisig address {} for account {}",
        record.address, account.index
    );
    Ok(record)
}

/// Flag `address` as used. Returns `false` if it already was.
pub fn mark_used(account: &mut WalletAccount, address: &str) -> Result<bool> {
    let index = account.index();
    let record = account
        .addresses_mut()
        .iter_mut()
        .find(|r| r.address == address)
        .ok_or_else(|| {
            KeystashError::validation(format!("Address {} does not belong to account {}", address, index))
        })?;

    if record.used {
        return Ok(false);
    }
    record.used = true;
    Ok(true)
}

fn counter(external: u32, internal: u32, branch: Branch) -> u32 {
    match branch {
        Branch::External => external,
        Branch::Internal => internal,
    }
}
