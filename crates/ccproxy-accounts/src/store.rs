//! JSON persistence for the account list.

use std::io;
use std::path::Path;

use crate::account::{Account, StoredAccount};

pub fn load_accounts(path: &Path) -> io::Result<Vec<Account>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read(path)?;
    let stored: Vec<StoredAccount> =
        serde_json::from_slice(&raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(stored.into_iter().map(Account::from_stored).collect())
}

pub fn save_accounts(path: &Path, accounts: &[Account]) -> io::Result<()> {
    let stored: Vec<StoredAccount> = accounts.iter().map(StoredAccount::from).collect();
    let raw = serde_json::to_vec_pretty(&stored)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw)
}
