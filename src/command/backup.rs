//! Backup command.
//!
//! Walks the cluster directory, copies files into
//! `backup/<stanza>/<label>/pg_data/...` through the compress/encrypt
//! pipeline, and writes the manifest last as the commit record. For
//! differential and incremental backups, files unchanged since the prior
//! backup (same size and mtime) are not copied again: the manifest entry
//! references the ancestor that stores them.

use std::path::{Path, PathBuf};

use anyhow::Error;
use log::{info, warn};
use serde_json::json;

use crate::config::Config;
use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::info::backup::{backup_label, BackupInfo, BackupType};
use crate::info::manifest::{Manifest, ManifestFile, ManifestLink, ManifestPath};
use crate::io::cipher::CipherEncryptFilter;
use crate::io::compress::{compress_filter, CompressType};
use crate::io::hash::{HashFilter, HashType};
use crate::io::page_checksum::{PageChecksumFilter, PG_PAGE_SIZE};
use crate::io::size::SizeFilter;
use crate::io::{FilterGroup, FilteredRead};
use crate::lock::{acquire, stop_check, LockType};
use crate::pack::{PackRead, PackWrite};
use crate::protocol::parallel::{ExecutorJob, ParallelExecutor};
use crate::protocol::spawn;
use crate::storage::{local_storage, repo_storage, FileType, InfoLevel, Storage, WriteOptions};
use crate::tools::size_format;

pub const CMD_BACKUP_FILE: &str = "backup-file";

// Cluster entries never copied: runtime state recreated by PostgreSQL.
const EXCLUDE_FILE: &[&str] = &["postmaster.pid", "postmaster.opts", "pg_internal.init"];
const EXCLUDE_CONTENT: &[&str] = &[
    "pg_wal",
    "pg_xlog",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
];

/// Result of copying one cluster file, packed for the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupFileResult {
    pub name: String,
    pub checksum: String,
    pub size: u64,
    pub repo_size: u64,
    pub page_errors: Vec<u64>,
}

impl BackupFileResult {
    pub fn to_pack(&self) -> Result<Vec<u8>, Error> {
        let mut pack = PackWrite::new();
        pack.write_str_at(1, &self.name)?;
        pack.write_str_at(2, &self.checksum)?;
        pack.write_u64_at(3, self.size)?;
        pack.write_u64_at(4, self.repo_size)?;
        pack.begin_array_at(5)?;
        for page in &self.page_errors {
            pack.write_u64(*page)?;
        }
        pack.end()?;
        pack.finish()
    }

    pub fn from_pack(data: &[u8]) -> Result<Self, Error> {
        let mut pack = PackRead::new(data);
        let name = pack
            .read_str(1)?
            .ok_or_else(|| vault_err(ErrorClass::Format, "backup result missing name"))?;
        let checksum = pack.read_str(2)?.unwrap_or_default();
        let size = pack.read_u64(3)?.unwrap_or(0);
        let repo_size = pack.read_u64(4)?.unwrap_or(0);

        let mut page_errors = Vec::new();
        if pack.begin_array(5)? {
            let mut id = 1;
            while let Some(page) = pack.read_u64(id)? {
                page_errors.push(page);
                id += 1;
            }
            pack.end()?;
        }

        Ok(BackupFileResult {
            name,
            checksum,
            size,
            repo_size,
            page_errors,
        })
    }
}

/// True for relation data files whose pages carry checksums; returns the
/// block number of the file's first page (non-zero for `.N` segment
/// files).
pub fn relation_first_block(name: &str) -> Option<u64> {
    let base = name.rsplit('/').next()?;
    let parent_ok = name.contains("base/") || name.contains("global/") || name.contains("pg_tblspc/");
    if !parent_ok {
        return None;
    }

    let blocks_per_segment = (1024 * 1024 * 1024) / PG_PAGE_SIZE as u64;
    match base.split_once('.') {
        None => {
            if base.chars().all(|c| c.is_ascii_digit()) && !base.is_empty() {
                Some(0)
            } else {
                None
            }
        }
        Some((rel, seg)) => {
            if rel.chars().all(|c| c.is_ascii_digit())
                && !rel.is_empty()
                && seg.chars().all(|c| c.is_ascii_digit())
                && !seg.is_empty()
            {
                Some(seg.parse::<u64>().ok()? * blocks_per_segment)
            } else {
                None
            }
        }
    }
}

/// Copy one cluster file into the repository, hashing the plain content
/// and optionally validating page checksums on the way through.
pub fn backup_file(
    source: &Path,
    storage: &Storage,
    repo_path: &str,
    name: &str,
    compress: CompressType,
    compress_level: u32,
    subkey: Option<&CipherConfig>,
    page_check: bool,
    first_block: u64,
) -> Result<BackupFileResult, Error> {
    let file = std::fs::File::open(source).map_err(|err| {
        vault_err(
            ErrorClass::FileRead,
            format!("unable to open '{}' - {}", source.display(), err),
        )
    })?;

    let mut read_group = FilterGroup::new();
    if page_check {
        read_group.push(Box::new(PageChecksumFilter::new(first_block)));
    }
    read_group.push(Box::new(HashFilter::new(HashType::Sha1)));
    read_group.push(Box::new(SizeFilter::new()));
    let mut read = FilteredRead::new(Box::new(file), read_group);

    let mut write_group = FilterGroup::new();
    if let Some(filter) = compress_filter(compress, compress_level) {
        write_group.push(filter);
    }
    if let Some(subkey) = subkey {
        write_group.push(Box::new(CipherEncryptFilter::new(subkey)?));
    }
    write_group.push(Box::new(SizeFilter::new()));
    let mut write = storage.new_write(repo_path, &WriteOptions::default(), write_group)?;

    let mut chunk = vec![0u8; crate::io::IO_BUFFER_SIZE];
    loop {
        let count = std::io::Read::read(&mut read, &mut chunk)?;
        if count == 0 {
            break;
        }
        write.write(&chunk[..count])?;
    }

    let read_results = read.results()?;
    let write_results = write.close()?;

    Ok(BackupFileResult {
        name: name.to_string(),
        checksum: read_results.digest("hash").unwrap_or("").to_string(),
        size: read_results.size("size").unwrap_or(0),
        repo_size: write_results.size("size").unwrap_or(0),
        page_errors: read_results
            .page_errors("page-checksum")
            .map(|pages| pages.to_vec())
            .unwrap_or_default(),
    })
}

// One file selected for the backup, before copy/reference resolution.
struct BackupPlanFile {
    name: String,
    source: PathBuf,
    size: u64,
    timestamp: i64,
    mode: u32,
    user: Option<String>,
    group: Option<String>,
}

fn excluded(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    if EXCLUDE_FILE.contains(&base) || base.starts_with("pgsql_tmp") {
        return true;
    }
    // Contents of runtime directories are skipped, the directories kept.
    EXCLUDE_CONTENT
        .iter()
        .any(|dir| name.starts_with(&format!("{}/", dir)))
}

pub fn cmd_backup(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    stop_check(&config.lock_path, Some(stanza))?;
    let _lock = acquire(&config.lock_path, stanza, LockType::Backup)?;

    let pg_path = config.pg_path.as_deref().ok_or_else(|| {
        vault_err(ErrorClass::Option, "option 'pg-path' is required for backup")
    })?;

    let storage = repo_storage(config)?;
    let cipher = config.cipher()?;

    let mut backup_info = BackupInfo::load(&storage, stanza, cipher.as_ref())?;
    let subkey = match &backup_info.cipher_pass {
        Some(pass) => Some(CipherConfig::new(pass)?),
        None => None,
    };
    backup_info =
        BackupInfo::load_reconstruct(&storage, stanza, cipher.as_ref(), subkey.as_ref())?;

    let pg = backup_info.current_pg().clone();
    if let (Some(version), Some(system_id)) = (&config.pg_version, config.pg_system_id) {
        if pg.version != *version || pg.system_id != system_id {
            return Err(vault_err(
                ErrorClass::BackupMismatch,
                format!(
                    "cluster version {} system-id {} does not match stanza version {} system-id {}",
                    version, system_id, pg.version, pg.system_id
                ),
            ));
        }
    }

    // Resolve the backup type against what actually exists.
    let mut backup_type = BackupType::parse(&config.backup_type)?;
    let prior = match backup_type {
        BackupType::Full => None,
        BackupType::Diff => backup_info.last(Some(BackupType::Full)).cloned(),
        BackupType::Incr => backup_info.last(None).cloned(),
    };
    if backup_type != BackupType::Full && prior.is_none() {
        warn!("no prior backup exists, {} backup has been changed to full", backup_type.as_str());
        backup_type = BackupType::Full;
    }
    let prior = if backup_type == BackupType::Full { None } else { prior };

    let now = chrono::Local::now().timestamp();
    let label = backup_label(backup_type, prior.as_ref().map(|p| p.label.as_str()), now)?;
    info!("new backup label = {}", label);

    let prior_manifest = match &prior {
        Some(prior) => Some(Manifest::load(&storage, stanza, &prior.label, subkey.as_ref())?),
        None => None,
    };

    // Walk the cluster.
    let cluster = local_storage(pg_path);
    let mut manifest = Manifest::new(&label, &pg.version, pg.db_id, pg.system_id, pg.catalog_version)?;
    manifest.timestamp_start = now;
    manifest.prior = prior.as_ref().map(|p| p.label.clone());
    manifest.compress_type = config.compress_type.clone();
    manifest.cipher_type = config.repo_cipher_type.clone();
    manifest.add_path(ManifestPath {
        name: String::from("pg_data"),
        mode: 0o700,
        user: None,
        group: None,
    });

    let mut plan: Vec<BackupPlanFile> = Vec::new();
    for entry in cluster.list_recursive("", InfoLevel::Detail)? {
        let name = format!("pg_data/{}", entry.name);
        if excluded(&entry.name) {
            continue;
        }

        match entry.file_type {
            FileType::Path => manifest.add_path(ManifestPath {
                name,
                mode: entry.mode.unwrap_or(0o700),
                user: entry.user.clone(),
                group: entry.group.clone(),
            }),
            FileType::Link => manifest.add_link(ManifestLink {
                name,
                destination: entry.link_target.clone().unwrap_or_default(),
            }),
            FileType::File => plan.push(BackupPlanFile {
                name,
                source: PathBuf::from(pg_path).join(&entry.name),
                size: entry.size,
                timestamp: entry.modification_time.unwrap_or(0),
                mode: entry.mode.unwrap_or(0o600),
                user: entry.user.clone(),
                group: entry.group.clone(),
            }),
            FileType::Special => {
                warn!("skipping special file '{}'", entry.name);
            }
        }
    }

    // Split into referenced (unchanged) and copied files.
    let compress = config.compress()?;
    let extension = compress.extension();
    let mut copies: Vec<BackupPlanFile> = Vec::new();

    for file in plan {
        let unchanged = prior_manifest.as_ref().and_then(|prior_manifest| {
            let prior_file = prior_manifest.file(&file.name)?;
            if prior_file.size == file.size && prior_file.timestamp == file.timestamp {
                Some(prior_file.clone())
            } else {
                None
            }
        });

        match unchanged {
            Some(prior_file) => {
                // Reference the backup that actually stores the content.
                let reference = prior_file
                    .reference
                    .clone()
                    .or_else(|| prior.as_ref().map(|p| p.label.clone()));
                manifest.add_file(ManifestFile {
                    name: file.name,
                    size: file.size,
                    checksum: prior_file.checksum.clone(),
                    mode: file.mode,
                    user: file.user,
                    group: file.group,
                    timestamp: file.timestamp,
                    reference,
                    page_checksum_error: prior_file.page_checksum_error.clone(),
                });
            }
            None => copies.push(file),
        }
    }

    info!(
        "backing up {} files ({} referenced from prior backups)",
        copies.len(),
        manifest.files.len()
    );

    // Copy, in parallel when more than one process is configured.
    let results = if config.process_max > 1 {
        backup_copy_parallel(config, stanza, &label, extension, &copies)?
    } else {
        let mut results = Vec::new();
        for file in &copies {
            let repo_path = format!("backup/{}/{}/{}{}", stanza, label, file.name, extension);
            results.push(backup_file(
                &file.source,
                &storage,
                &repo_path,
                &file.name,
                compress,
                config.compress_level,
                subkey.as_ref(),
                relation_first_block(&file.name).is_some(),
                relation_first_block(&file.name).unwrap_or(0),
            )?);
        }
        results
    };

    for (file, result) in copies.iter().zip(results.iter()) {
        if !result.page_errors.is_empty() {
            warn!(
                "invalid page checksums found in file '{}': {:?}",
                file.name, result.page_errors
            );
        }
        manifest.add_file(ManifestFile {
            name: file.name.clone(),
            size: result.size,
            checksum: Some(result.checksum.clone()),
            mode: file.mode,
            user: file.user.clone(),
            group: file.group.clone(),
            timestamp: file.timestamp,
            reference: None,
            page_checksum_error: result.page_errors.clone(),
        });
    }

    manifest.timestamp_stop = chrono::Local::now().timestamp();

    // The manifest write is the commit: without it the backup does not
    // exist and expire will clean the directory up.
    manifest.save(&storage, stanza, subkey.as_ref())?;

    backup_info.add(manifest.to_backup_entry());
    backup_info.save(&storage, stanza, cipher.as_ref())?;

    info!(
        "{} backup '{}' complete: {} copied, {} total",
        backup_type.as_str(),
        label,
        size_format(manifest.stored_size()),
        size_format(manifest.total_size())
    );

    Ok(0)
}

fn backup_copy_parallel(
    config: &Config,
    stanza: &str,
    label: &str,
    extension: &str,
    copies: &[BackupPlanFile],
) -> Result<Vec<BackupFileResult>, Error> {
    let workers = spawn::spawn_pool(config, &config.command, config.process_max)?;
    let (clients, children) = spawn::into_clients(workers);

    let mut queue: Vec<ExecutorJob> = copies
        .iter()
        .map(|file| {
            let repo_path = format!("backup/{}/{}/{}{}", stanza, label, file.name, extension);
            ExecutorJob::new(
                file.name.clone(),
                CMD_BACKUP_FILE,
                vec![
                    json!(file.source.to_str()),
                    json!(repo_path),
                    json!(file.name),
                    json!(relation_first_block(&file.name)),
                ],
            )
            .retry(1, std::time::Duration::from_secs(1))
        })
        .collect();
    queue.reverse();

    let mut by_name = std::collections::HashMap::new();
    let mut executor =
        ParallelExecutor::new(clients, config.protocol_timeout, move || queue.pop());

    let run = executor.run(|result| {
        let out = result.out?;
        let encoded = out.as_str().ok_or_else(|| {
            vault_err(ErrorClass::Protocol, "backup-file returned no result pack")
        })?;
        let decoded = BackupFileResult::from_pack(&base64::decode(encoded).map_err(|err| {
            vault_err(ErrorClass::Protocol, format!("invalid result pack - {}", err))
        })?)?;
        by_name.insert(result.key.clone(), decoded);
        Ok(())
    });

    spawn::reap({
        let clients = executor.finish();
        drop(clients);
        children
    });
    run?;

    // Reorder to match the copy plan.
    copies
        .iter()
        .map(|file| {
            by_name.remove(&file.name).ok_or_else(|| {
                vault_err(
                    ErrorClass::Protocol,
                    format!("no result for backed up file '{}'", file.name),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load, CommandLine, CommandRole};

    fn test_config(dir: &tempfile::TempDir, extra: &[(&str, &str)]) -> Config {
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
        options.insert("pg-version".to_string(), "14".to_string());
        options.insert("pg-system-id".to_string(), "1000".to_string());
        for (key, value) in extra {
            options.insert(key.to_string(), value.to_string());
        }

        load(&CommandLine {
            command: String::from("backup"),
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
        std::fs::create_dir_all(pg.join("pg_wal")).unwrap();
        std::fs::write(pg.join("PG_VERSION"), b"14\n").unwrap();
        std::fs::write(pg.join("global/pg_control"), vec![1u8; 512]).unwrap();
        std::fs::write(pg.join("base/1/1255"), vec![2u8; 1024]).unwrap();
        std::fs::write(pg.join("postmaster.pid"), b"1234\n").unwrap();
        std::fs::write(pg.join("pg_wal/000000010000000000000001"), vec![0u8; 64]).unwrap();
    }

    fn create_stanza(config: &Config) {
        let storage = repo_storage(config).unwrap();
        let info = BackupInfo::new("14", 1000, 202107181, 1300, None);
        info.save(&storage, "main", None).unwrap();
        crate::info::archive::ArchiveInfo::new("14", 1000, None)
            .save(&storage, "main", None)
            .unwrap();
    }

    #[test]
    fn full_backup_writes_manifest_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, &[("type", "full")]);
        make_cluster(&dir);
        create_stanza(&config);

        assert_eq!(cmd_backup(&config).unwrap(), 0);

        let storage = repo_storage(&config).unwrap();
        let info = BackupInfo::load(&storage, "main", None).unwrap();
        assert_eq!(info.labels().len(), 1);

        let label = info.labels().remove(0);
        let manifest = Manifest::load(&storage, "main", &label, None).unwrap();

        // Runtime files are excluded, data files are present.
        assert!(manifest.file("pg_data/postmaster.pid").is_none());
        assert!(manifest.file("pg_data/pg_wal/000000010000000000000001").is_none());
        let control = manifest.file("pg_data/global/pg_control").unwrap();
        assert_eq!(control.size, 512);
        assert_eq!(control.checksum.as_ref().unwrap().len(), 40);

        // Copies are stored compressed in the backup directory.
        assert!(storage
            .exists(&format!("backup/main/{}/pg_data/global/pg_control.gz", label))
            .unwrap());
    }

    #[test]
    fn incr_references_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);

        let full_config = test_config(&dir, &[("type", "full")]);
        create_stanza(&full_config);
        cmd_backup(&full_config).unwrap();

        // Change one file, leave the other untouched.
        std::fs::write(dir.path().join("pg/base/1/1255"), vec![9u8; 2048]).unwrap();

        let incr_config = test_config(&dir, &[("type", "incr")]);
        cmd_backup(&incr_config).unwrap();

        let storage = repo_storage(&incr_config).unwrap();
        let info = BackupInfo::load(&storage, "main", None).unwrap();
        let labels = info.labels();
        assert_eq!(labels.len(), 2);

        let incr_label = &labels[1];
        let manifest = Manifest::load(&storage, "main", incr_label, None).unwrap();

        let changed = manifest.file("pg_data/base/1/1255").unwrap();
        assert!(changed.reference.is_none());
        assert_eq!(changed.size, 2048);

        let unchanged = manifest.file("pg_data/PG_VERSION").unwrap();
        assert_eq!(unchanged.reference.as_deref(), Some(labels[0].as_str()));

        // The registry entry records the reference chain.
        let entry = info.get(incr_label).unwrap();
        assert_eq!(entry.reference, vec![labels[0].clone()]);
        assert_eq!(entry.prior.as_deref(), Some(labels[0].as_str()));
    }

    #[test]
    fn incr_without_prior_becomes_full() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, &[("type", "incr")]);
        make_cluster(&dir);
        create_stanza(&config);

        cmd_backup(&config).unwrap();

        let storage = repo_storage(&config).unwrap();
        let info = BackupInfo::load(&storage, "main", None).unwrap();
        let label = info.labels().remove(0);
        assert!(label.ends_with('F'));
    }

    #[test]
    fn relation_detection() {
        assert_eq!(relation_first_block("pg_data/base/1/1255"), Some(0));
        assert_eq!(
            relation_first_block("pg_data/base/1/16384.2"),
            Some(2 * (1024 * 1024 * 1024 / PG_PAGE_SIZE as u64))
        );
        assert_eq!(relation_first_block("pg_data/global/pg_control"), None);
        assert_eq!(relation_first_block("pg_data/PG_VERSION"), None);
        assert_eq!(relation_first_block("pg_data/base/1/1255_fsm"), None);
    }
}
