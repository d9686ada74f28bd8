//! Stanza lifecycle commands.

use anyhow::Error;
use log::info;

use crate::config::Config;
use crate::crypt::{generate_passphrase, CipherType};
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::BackupInfo;
use crate::lock::{acquire, lock_file_path, stop_check, LockType};
use crate::storage::repo_storage;

fn pg_options(config: &Config) -> Result<(String, u64, u32, u32), Error> {
    let version = config.pg_version.clone().ok_or_else(|| {
        vault_err(ErrorClass::Option, "option 'pg-version' is required for this command")
    })?;
    let system_id = config.pg_system_id.ok_or_else(|| {
        vault_err(ErrorClass::Option, "option 'pg-system-id' is required for this command")
    })?;

    Ok((
        version,
        system_id,
        config.pg_catalog_version.unwrap_or(0),
        config.pg_control_version.unwrap_or(0),
    ))
}

/// Create the stanza: write both registries atomically. Re-running against
/// a matching cluster is a no-op.
pub fn cmd_stanza_create(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    stop_check(&config.lock_path, Some(stanza))?;
    let _archive_lock = acquire(&config.lock_path, stanza, LockType::Archive)?;
    let _backup_lock = acquire(&config.lock_path, stanza, LockType::Backup)?;

    let (version, system_id, catalog_version, control_version) = pg_options(config)?;
    let storage = repo_storage(config)?;
    let cipher = config.cipher()?;

    let archive_exists = storage.exists(&ArchiveInfo::path(stanza))?;
    let backup_exists = storage.exists(&BackupInfo::path(stanza))?;

    if archive_exists && backup_exists {
        // Both present: verify they describe this cluster.
        let archive_info = ArchiveInfo::load(&storage, stanza, cipher.as_ref())?;
        archive_info.check(&version, system_id)?;
        info!("stanza '{}' already exists and matches the cluster", stanza);
        return Ok(0);
    }

    if archive_exists || backup_exists {
        return Err(vault_err(
            ErrorClass::FileMissing,
            format!(
                "stanza '{}' is partially created - delete it and create it again",
                stanza
            ),
        ));
    }

    // With repo encryption each registry carries a fresh subkey.
    let encrypted = config.cipher_type()? != CipherType::None;
    let archive_pass = if encrypted { Some(generate_passphrase()?) } else { None };
    let backup_pass = if encrypted { Some(generate_passphrase()?) } else { None };

    ArchiveInfo::new(&version, system_id, archive_pass)
        .save(&storage, stanza, cipher.as_ref())?;
    BackupInfo::new(&version, system_id, catalog_version, control_version, backup_pass)
        .save(&storage, stanza, cipher.as_ref())?;

    info!("stanza '{}' created", stanza);
    Ok(0)
}

/// Register a new cluster (after pg_upgrade) in both registries.
pub fn cmd_stanza_upgrade(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    stop_check(&config.lock_path, Some(stanza))?;
    let _archive_lock = acquire(&config.lock_path, stanza, LockType::Archive)?;
    let _backup_lock = acquire(&config.lock_path, stanza, LockType::Backup)?;

    let (version, system_id, catalog_version, control_version) = pg_options(config)?;
    let storage = repo_storage(config)?;
    let cipher = config.cipher()?;

    let mut archive_info = ArchiveInfo::load(&storage, stanza, cipher.as_ref())?;
    let mut backup_info = BackupInfo::load(&storage, stanza, cipher.as_ref())?;

    let current = archive_info.current();
    if current.version == version && current.system_id == system_id {
        info!("stanza '{}' is already on this cluster - upgrade not required", stanza);
        return Ok(0);
    }

    archive_info.upgrade(&version, system_id);
    backup_info.upgrade(&version, system_id, catalog_version, control_version);

    archive_info.save(&storage, stanza, cipher.as_ref())?;
    backup_info.save(&storage, stanza, cipher.as_ref())?;

    info!(
        "stanza '{}' upgraded to version {} system-id {}",
        stanza, version, system_id
    );
    Ok(0)
}

/// Remove the stanza from the repository. Requires the stanza to be
/// stopped and `--force`.
pub fn cmd_stanza_delete(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;

    if !config.force {
        return Err(vault_err(
            ErrorClass::Option,
            "option '--force' is required to delete a stanza",
        ));
    }

    // Deleting requires the stop file: it proves intent and keeps the
    // archive hook from racing the removal.
    if stop_check(&config.lock_path, Some(stanza)).is_ok() {
        return Err(vault_err(
            ErrorClass::Stop,
            format!("stanza '{}' is not stopped - run the stop command first", stanza),
        ));
    }

    // Confirm no command holds the stanza.
    let _archive_lock = acquire(&config.lock_path, stanza, LockType::Archive)?;
    let _backup_lock = acquire(&config.lock_path, stanza, LockType::Backup)?;

    let storage = repo_storage(config)?;
    storage.path_remove(&format!("backup/{}", stanza), true)?;
    storage.path_remove(&format!("archive/{}", stanza), true)?;

    // Locks are released at return; the files themselves are removed so a
    // recreated stanza starts clean.
    let _ = std::fs::remove_file(lock_file_path(&config.lock_path, stanza, LockType::Archive));
    let _ = std::fs::remove_file(lock_file_path(&config.lock_path, stanza, LockType::Backup));

    info!("stanza '{}' deleted", stanza);
    Ok(0)
}
