//! Check command: validate that the stanza configuration is usable.

use anyhow::Error;
use log::info;

use crate::config::Config;
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::BackupInfo;
use crate::storage::repo_storage;

/// Verify the repository is reachable, both registries load, and the
/// configured cluster matches the stanza.
pub fn cmd_check(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;

    let storage = repo_storage(config)?;
    let cipher = config.cipher()?;

    let archive_info = ArchiveInfo::load(&storage, stanza, cipher.as_ref())?;
    let backup_info = BackupInfo::load(&storage, stanza, cipher.as_ref())?;

    if let (Some(version), Some(system_id)) = (&config.pg_version, config.pg_system_id) {
        archive_info.check(version, system_id)?;

        let pg = backup_info.current_pg();
        if pg.version != *version || pg.system_id != system_id {
            return Err(vault_err(
                ErrorClass::BackupMismatch,
                format!(
                    "backup registry is for version {} system-id {} but the cluster is version {} system-id {}",
                    pg.version, pg.system_id, version, system_id
                ),
            ));
        }
    }

    // The archive directory for the current cluster must be writable; an
    // empty listing is fine for a fresh stanza.
    let archive_path = format!("archive/{}/{}", stanza, archive_info.archive_id());
    storage.list(&archive_path, None, crate::storage::InfoLevel::Exists)?;

    info!(
        "check stanza '{}' ok: repository reachable, archive id {}",
        stanza,
        archive_info.archive_id()
    );
    Ok(0)
}
