//! Expire command.
//!
//! Applies the retention policy: keep the newest N full backups, dropping
//! older fulls together with every differential and incremental that
//! depends on them, then trim the WAL archive to what the surviving
//! backups still need.

use anyhow::Error;
use log::{info, warn};

use crate::config::Config;
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::{BackupInfo, BackupType};
use crate::lock::{acquire, stop_check, LockType};
use crate::storage::{repo_storage, InfoLevel, Storage};

pub fn cmd_expire(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    stop_check(&config.lock_path, Some(stanza))?;
    let _lock = acquire(&config.lock_path, stanza, LockType::Backup)?;

    let storage = repo_storage(config)?;
    let cipher = config.cipher()?;
    let mut backup_info = BackupInfo::load(&storage, stanza, cipher.as_ref())?;

    let expired = match config.repo_retention_full {
        Some(keep) => expire_backups(&storage, stanza, &mut backup_info, keep as usize)?,
        None => {
            warn!("option 'repo-retention-full' is not set - no backups will be expired");
            Vec::new()
        }
    };

    if !expired.is_empty() {
        backup_info.save(&storage, stanza, cipher.as_ref())?;
    }

    // Archive retention follows the earliest backup still kept.
    if config.repo_retention_full.is_some() || config.repo_retention_archive.is_some() {
        let archive_info = ArchiveInfo::load(&storage, stanza, cipher.as_ref())?;
        expire_archive(&storage, stanza, &backup_info, &archive_info)?;
    }

    Ok(0)
}

/// Remove full backups beyond the retention count, along with their
/// dependents. Returns the removed labels.
fn expire_backups(
    storage: &Storage,
    stanza: &str,
    backup_info: &mut BackupInfo,
    keep_full: usize,
) -> Result<Vec<String>, Error> {
    if keep_full == 0 {
        return Err(vault_err(
            ErrorClass::Option,
            "repo-retention-full must be at least 1",
        ));
    }

    let fulls: Vec<String> = backup_info
        .current
        .values()
        .filter(|entry| entry.backup_type == BackupType::Full)
        .map(|entry| entry.label.clone())
        .collect();

    if fulls.len() <= keep_full {
        return Ok(Vec::new());
    }

    let mut expired = Vec::new();
    for full in &fulls[..fulls.len() - keep_full] {
        // Dependents first so a crash mid-expire never leaves an
        // incremental without its ancestors.
        let mut doomed = backup_info.dependents(full);
        doomed.sort();
        doomed.push(full.clone());

        for label in doomed {
            info!("expire backup '{}'", label);
            storage.path_remove(&format!("backup/{}/{}", stanza, label), true)?;
            backup_info.remove(&label);
            expired.push(label);
        }
    }

    Ok(expired)
}

/// Remove archive segments older than the earliest kept backup needs.
fn expire_archive(
    storage: &Storage,
    stanza: &str,
    backup_info: &BackupInfo,
    archive_info: &ArchiveInfo,
) -> Result<(), Error> {
    // The archive start of the oldest surviving backup is the floor; with
    // no backups left nothing can be safely expired.
    let floor = match backup_info
        .current
        .values()
        .filter_map(|entry| entry.archive_start.clone())
        .min()
    {
        Some(floor) => floor,
        None => {
            warn!("no backups remain - archive expiry skipped");
            return Ok(());
        }
    };
    let floor_dir = floor[0..16].to_string();

    for entry in &archive_info.history {
        let archive_path = format!("archive/{}/{}-{}", stanza, entry.version, entry.db_id);

        for dir in storage.list(&archive_path, None, InfoLevel::Exists)? {
            // Only the 16-hex segment directories participate.
            if dir.name.len() != 16 || !dir.name.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }

            let dir_path = format!("{}/{}", archive_path, dir.name);
            if dir.name < floor_dir {
                info!("expire archive path '{}'", dir_path);
                storage.path_remove(&dir_path, true)?;
            } else if dir.name == floor_dir {
                // Inside the boundary directory expire by segment name.
                for file in storage.list(&dir_path, None, InfoLevel::Exists)? {
                    if file.name.len() >= 24 && &file.name[0..24] < floor.as_str() {
                        info!("expire archive file '{}/{}'", dir_path, file.name);
                        storage.remove(&format!("{}/{}", dir_path, file.name), false)?;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::backup::BackupEntry;
    use crate::storage::local_storage;

    fn entry(label: &str, archive_start: &str, reference: &[&str]) -> BackupEntry {
        BackupEntry {
            label: label.to_string(),
            backup_type: crate::info::backup::label_type(label).unwrap(),
            timestamp_start: 0,
            timestamp_stop: 0,
            archive_start: Some(archive_start.to_string()),
            archive_stop: None,
            prior: None,
            reference: reference.iter().map(|s| s.to_string()).collect(),
            size: 0,
            repo_size: 0,
            db_id: 1,
            compress_type: String::from("gz"),
        }
    }

    fn seed(storage: &Storage, info: &BackupInfo) {
        for label in info.labels() {
            storage
                .put(&format!("backup/main/{}/backup.manifest", label), b"x")
                .unwrap();
        }
    }

    #[test]
    fn retention_removes_old_fulls_and_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let storage = local_storage(dir.path().to_str().unwrap());

        let mut info = BackupInfo::new("14", 1000, 202107181, 1300, None);
        info.add(entry("20250101-000000F", "000000010000000000000002", &[]));
        info.add(entry(
            "20250101-000000F_20250102-000000I",
            "000000010000000000000005",
            &["20250101-000000F"],
        ));
        info.add(entry("20250103-000000F", "000000010000000000000008", &[]));
        info.add(entry("20250105-000000F", "00000001000000000000000B", &[]));
        seed(&storage, &info);

        let expired = expire_backups(&storage, "main", &mut info, 2).unwrap();

        assert_eq!(
            expired,
            vec![
                "20250101-000000F_20250102-000000I".to_string(),
                "20250101-000000F".to_string(),
            ]
        );
        assert_eq!(info.labels(), vec!["20250103-000000F", "20250105-000000F"]);
        assert!(!storage.exists("backup/main/20250101-000000F/backup.manifest").unwrap());
        assert!(storage.exists("backup/main/20250103-000000F/backup.manifest").unwrap());
    }

    #[test]
    fn retention_noop_when_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let storage = local_storage(dir.path().to_str().unwrap());

        let mut info = BackupInfo::new("14", 1000, 202107181, 1300, None);
        info.add(entry("20250103-000000F", "000000010000000000000008", &[]));
        seed(&storage, &info);

        assert!(expire_backups(&storage, "main", &mut info, 2).unwrap().is_empty());
        assert_eq!(info.labels().len(), 1);
    }

    #[test]
    fn archive_trimmed_to_earliest_kept() {
        let dir = tempfile::tempdir().unwrap();
        let storage = local_storage(dir.path().to_str().unwrap());

        let mut info = BackupInfo::new("14", 1000, 202107181, 1300, None);
        info.add(entry("20250103-000000F", "000000010000000100000002", &[]));
        let archive = ArchiveInfo::new("14", 1000, None);

        // Older directory, boundary directory, newer directory.
        storage
            .put("archive/main/14-1/0000000100000000/000000010000000000000001-aa.gz", b"x")
            .unwrap();
        storage
            .put("archive/main/14-1/0000000100000001/000000010000000100000001-bb.gz", b"x")
            .unwrap();
        storage
            .put("archive/main/14-1/0000000100000001/000000010000000100000002-cc.gz", b"x")
            .unwrap();
        storage
            .put("archive/main/14-1/0000000100000002/000000010000000200000000-dd.gz", b"x")
            .unwrap();
        storage.put("archive/main/14-1/00000002.history", b"h").unwrap();

        expire_archive(&storage, "main", &info, &archive).unwrap();

        // Everything before the floor segment is gone, the floor and later
        // segments and history files survive.
        assert!(!storage.exists("archive/main/14-1/0000000100000000").unwrap());
        assert!(!storage
            .exists("archive/main/14-1/0000000100000001/000000010000000100000001-bb.gz")
            .unwrap());
        assert!(storage
            .exists("archive/main/14-1/0000000100000001/000000010000000100000002-cc.gz")
            .unwrap());
        assert!(storage
            .exists("archive/main/14-1/0000000100000002/000000010000000200000000-dd.gz")
            .unwrap());
        assert!(storage.exists("archive/main/14-1/00000002.history").unwrap());
    }

    #[test]
    fn no_backups_skips_archive_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = local_storage(dir.path().to_str().unwrap());

        let info = BackupInfo::new("14", 1000, 202107181, 1300, None);
        let archive = ArchiveInfo::new("14", 1000, None);
        storage
            .put("archive/main/14-1/0000000100000000/000000010000000000000001-aa.gz", b"x")
            .unwrap();

        expire_archive(&storage, "main", &info, &archive).unwrap();
        assert!(storage
            .exists("archive/main/14-1/0000000100000000/000000010000000000000001-aa.gz")
            .unwrap());
    }
}
