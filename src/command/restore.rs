//! Restore command.
//!
//! Rebuilds the cluster data directory from a backup set: paths and links
//! first, then every manifest file, pulling referenced files from their
//! ancestor backups. Each file is decoded through the decrypt/decompress
//! chain and its checksum verified against the manifest before it lands.
//! With `--delta` an existing data directory is reused: files whose size
//! and checksum already match are kept, everything else is replaced and
//! files not in the manifest are removed.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Error;
use log::{info, warn};

use crate::config::Config;
use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::info::backup::BackupInfo;
use crate::info::manifest::{Manifest, ManifestFile};
use crate::io::cipher::CipherDecryptFilter;
use crate::io::compress::{decompress_filter, CompressType};
use crate::io::hash::{HashFilter, HashType};
use crate::io::FilterGroup;
use crate::lock::stop_check;
use crate::storage::{local_storage, repo_storage, InfoLevel, Storage};
use crate::tools::size_format;

pub fn cmd_restore(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    stop_check(&config.lock_path, Some(stanza))?;

    let pg_path = config.pg_path.as_deref().ok_or_else(|| {
        vault_err(ErrorClass::Option, "option 'pg-path' is required for restore")
    })?;

    // Refuse to restore over a running cluster.
    if Path::new(pg_path).join("postmaster.pid").exists() {
        return Err(vault_err(
            ErrorClass::CommandInvalid,
            format!(
                "unable to restore while PostgreSQL is running on '{}'\n\
                 HINT: stop the cluster and remove postmaster.pid",
                pg_path
            ),
        ));
    }

    let storage = repo_storage(config)?;
    let cipher = config.cipher()?;
    let backup_info = BackupInfo::load(&storage, stanza, cipher.as_ref())?;
    let subkey = match &backup_info.cipher_pass {
        Some(pass) => Some(CipherConfig::new(pass)?),
        None => None,
    };

    let label = match &config.set {
        Some(set) => backup_info
            .get(set)
            .ok_or_else(|| {
                vault_err(
                    ErrorClass::FileMissing,
                    format!("backup set '{}' does not exist", set),
                )
            })?
            .label
            .clone(),
        None => backup_info
            .last(None)
            .ok_or_else(|| vault_err(ErrorClass::FileMissing, "no backup exists to restore"))?
            .label
            .clone(),
    };
    info!("restore backup set {}", label);

    let manifest = Manifest::load(&storage, stanza, &label, subkey.as_ref())?;

    let cluster = local_storage(pg_path);
    let existing = cluster.list("", None, InfoLevel::Exists)?;
    if !existing.is_empty() && !config.delta {
        return Err(vault_err(
            ErrorClass::PathMissing,
            format!(
                "unable to restore to '{}' - path is not empty\n\
                 HINT: use --delta to overwrite in place",
                pg_path
            ),
        ));
    }

    // Paths first, then links.
    for (name, path) in &manifest.paths {
        let dest = map_name(pg_path, name);
        std::fs::create_dir_all(&dest)?;
        let _ = std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(path.mode));
    }
    for (name, link) in &manifest.links {
        let dest = map_name(pg_path, name);
        if dest.exists() || dest.symlink_metadata().is_ok() {
            std::fs::remove_file(&dest).ok();
        }
        std::os::unix::fs::symlink(&link.destination, &dest).map_err(|err| {
            vault_err(
                ErrorClass::FileWrite,
                format!("unable to create link '{}' - {}", dest.display(), err),
            )
        })?;
    }

    let mut restored: u64 = 0;
    let mut skipped: u64 = 0;
    let mut bytes: u64 = 0;

    for file in manifest.files.values() {
        let dest = map_name(pg_path, &file.name);

        if config.delta && delta_match(&dest, file)? {
            skipped += 1;
            continue;
        }

        restore_file(&storage, stanza, &manifest, file, &dest, subkey.as_ref())?;
        restored += 1;
        bytes += file.size;
    }

    // In delta mode anything not in the manifest is surplus, except WAL:
    // recovery may still need segments that postdate the backup.
    if config.delta {
        for entry in cluster.list_recursive("", InfoLevel::Exists)? {
            if entry.file_type != crate::storage::FileType::File {
                continue;
            }
            if entry.name.starts_with("pg_wal/") || entry.name.starts_with("pg_xlog/") {
                continue;
            }
            let name = format!("pg_data/{}", entry.name);
            if manifest.file(&name).is_none() {
                warn!("remove invalid file '{}'", entry.name);
                cluster.remove(&entry.name, false)?;
            }
        }
    }

    info!(
        "restore complete: {} files restored ({}), {} unchanged",
        restored,
        size_format(bytes),
        skipped
    );
    Ok(0)
}

// Manifest names are anchored at pg_data; map them into the target path.
fn map_name(pg_path: &str, name: &str) -> PathBuf {
    match name.strip_prefix("pg_data/") {
        Some(rest) => PathBuf::from(pg_path).join(rest),
        None => PathBuf::from(pg_path).join(name.strip_prefix("pg_data").unwrap_or(name)),
    }
}

// A file matches in delta mode when size and checksum agree.
fn delta_match(dest: &Path, file: &ManifestFile) -> Result<bool, Error> {
    let meta = match std::fs::metadata(dest) {
        Ok(meta) => meta,
        Err(_) => return Ok(false),
    };
    if meta.len() != file.size {
        return Ok(false);
    }

    let expected = match &file.checksum {
        Some(checksum) => checksum,
        None => return Ok(false),
    };

    let data = std::fs::read(dest)?;
    Ok(HashFilter::digest_buf(HashType::Sha1, &data)? == *expected)
}

/// Fetch one manifest file from the repository into place.
fn restore_file(
    storage: &Storage,
    stanza: &str,
    manifest: &Manifest,
    file: &ManifestFile,
    dest: &Path,
    subkey: Option<&CipherConfig>,
) -> Result<(), Error> {
    // A referenced file is stored by an ancestor backup.
    let source_label = file.reference.as_deref().unwrap_or(&manifest.label);
    let extension = CompressType::parse(&manifest.compress_type)
        .unwrap_or(CompressType::None)
        .extension();
    let repo_path = format!("backup/{}/{}/{}{}", stanza, source_label, file.name, extension);

    let mut group = FilterGroup::new();
    if subkey.is_some() {
        group.push(Box::new(CipherDecryptFilter::new(subkey.unwrap())));
    }
    if let Some(filter) = decompress_filter(CompressType::from_name(&repo_path)) {
        group.push(filter);
    }
    group.push(Box::new(HashFilter::new(HashType::Sha1)));

    let mut read = match storage.new_read(&repo_path, false, group)? {
        Some(read) => read,
        None => {
            return Err(vault_err(
                ErrorClass::FileMissing,
                format!("backup file '{}' is missing from the repository", repo_path),
            ))
        }
    };
    let data = read.read_all()?;
    let results = read.results()?;

    if let Some(expected) = &file.checksum {
        let actual = results.digest("hash").unwrap_or("");
        if actual != expected {
            return Err(vault_err(
                ErrorClass::Checksum,
                format!(
                    "checksum for restored file '{}' is '{}' but manifest expects '{}'",
                    file.name, actual, expected
                ),
            ));
        }
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, &data).map_err(|err| {
        vault_err(
            ErrorClass::FileWrite,
            format!("unable to write '{}' - {}", dest.display(), err),
        )
    })?;

    let _ = std::fs::set_permissions(dest, std::fs::Permissions::from_mode(file.mode));

    let tv = nix::sys::time::TimeVal::new(file.timestamp, 0);
    let _ = nix::sys::stat::utimes(dest, &tv, &tv);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::backup::cmd_backup;
    use crate::config::{load, CommandLine, CommandRole};

    fn config_for(dir: &tempfile::TempDir, command: &str, extra: &[(&str, &str)]) -> Config {
        let mut options = std::collections::HashMap::new();
        options.insert("stanza".to_string(), "main".to_string());
        options.insert(
            "repo-path".to_string(),
            dir.path().join("repo").to_str().unwrap().to_string(),
        );
        options.insert(
            "pg-path".to_string(),
            dir.path().join("pg").to_str().unwrap().to_string(),
        );
        options.insert(
            "lock-path".to_string(),
            dir.path().join("lock").to_str().unwrap().to_string(),
        );
        for (key, value) in extra {
            options.insert(key.to_string(), value.to_string());
        }

        load(&CommandLine {
            command: command.to_string(),
            role: CommandRole::Default,
            parameters: Vec::new(),
            config_file: Some(String::from("/nonexistent")),
            options,
        })
        .unwrap()
    }

    fn make_cluster(dir: &tempfile::TempDir) {
        let pg = dir.path().join("pg");
        std::fs::create_dir_all(pg.join("global")).unwrap();
        std::fs::create_dir_all(pg.join("base/1")).unwrap();
        std::fs::write(pg.join("PG_VERSION"), b"14\n").unwrap();
        std::fs::write(pg.join("global/pg_control"), vec![1u8; 512]).unwrap();
        std::fs::write(pg.join("base/1/1255"), (0..2048u32).map(|v| (v % 251) as u8).collect::<Vec<u8>>()).unwrap();
    }

    fn create_stanza(config: &Config) {
        let storage = repo_storage(config).unwrap();
        BackupInfo::new("14", 1000, 202107181, 1300, None)
            .save(&storage, "main", None)
            .unwrap();
        crate::info::archive::ArchiveInfo::new("14", 1000, None)
            .save(&storage, "main", None)
            .unwrap();
    }

    #[test]
    fn backup_then_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);

        let backup_config = config_for(&dir, "backup", &[("type", "full")]);
        create_stanza(&backup_config);
        cmd_backup(&backup_config).unwrap();

        // Wipe the cluster, then restore it.
        let original = std::fs::read(dir.path().join("pg/base/1/1255")).unwrap();
        std::fs::remove_dir_all(dir.path().join("pg")).unwrap();

        let restore_config = config_for(&dir, "restore", &[]);
        assert_eq!(cmd_restore(&restore_config).unwrap(), 0);

        assert_eq!(std::fs::read(dir.path().join("pg/PG_VERSION")).unwrap(), b"14\n");
        assert_eq!(std::fs::read(dir.path().join("pg/base/1/1255")).unwrap(), original);
    }

    #[test]
    fn restore_refuses_non_empty_without_delta() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);

        let backup_config = config_for(&dir, "backup", &[("type", "full")]);
        create_stanza(&backup_config);
        cmd_backup(&backup_config).unwrap();

        let restore_config = config_for(&dir, "restore", &[]);
        let err = cmd_restore(&restore_config).unwrap_err();
        assert_eq!(crate::error::error_class(&err), ErrorClass::PathMissing);
    }

    #[test]
    fn delta_restore_fixes_changed_files_and_removes_surplus() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);

        let backup_config = config_for(&dir, "backup", &[("type", "full")]);
        create_stanza(&backup_config);
        cmd_backup(&backup_config).unwrap();

        // Corrupt one file and add a surplus one.
        std::fs::write(dir.path().join("pg/base/1/1255"), b"corrupted").unwrap();
        std::fs::write(dir.path().join("pg/base/1/junk"), b"surplus").unwrap();

        let restore_config = config_for(&dir, "restore", &[("delta", "y")]);
        cmd_restore(&restore_config).unwrap();

        let restored = std::fs::read(dir.path().join("pg/base/1/1255")).unwrap();
        assert_eq!(restored.len(), 2048);
        assert!(!dir.path().join("pg/base/1/junk").exists());
    }

    #[test]
    fn restore_running_cluster_refused() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);
        std::fs::write(dir.path().join("pg/postmaster.pid"), b"1234\n").unwrap();

        let restore_config = config_for(&dir, "restore", &[]);
        let err = cmd_restore(&restore_config).unwrap_err();
        assert_eq!(crate::error::error_class(&err), ErrorClass::CommandInvalid);
    }

    #[test]
    fn missing_set_reported() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);
        let backup_config = config_for(&dir, "backup", &[("type", "full")]);
        create_stanza(&backup_config);
        cmd_backup(&backup_config).unwrap();
        std::fs::remove_dir_all(dir.path().join("pg")).unwrap();

        let restore_config = config_for(&dir, "restore", &[("set", "20990101-000000F")]);
        let err = cmd_restore(&restore_config).unwrap_err();
        assert_eq!(crate::error::error_class(&err), ErrorClass::FileMissing);
    }
}
