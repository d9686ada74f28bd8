//! Verify command.
//!
//! Re-reads repository files and proves they still decode to the content
//! their names or manifests promise: archive segments against the hash
//! embedded in the file name, backup files against their manifest entry,
//! and manifest references against the registry (a referenced ancestor
//! must exist and must list the file).

use anyhow::Error;
use log::{info, warn};

use crate::config::Config;
use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::BackupInfo;
use crate::info::manifest::Manifest;
use crate::io::cipher::CipherDecryptFilter;
use crate::io::compress::{decompress_filter, CompressType};
use crate::io::hash::{HashFilter, HashType};
use crate::io::FilterGroup;
use crate::pack::{PackRead, PackWrite};
use crate::storage::{repo_storage, InfoLevel, Storage};

pub const CMD_VERIFY_FILE: &str = "verify-file";

/// Outcome of verifying one repository file, packed for the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyFileResult {
    pub path: String,
    pub valid: bool,
    pub message: String,
}

impl VerifyFileResult {
    pub fn to_pack(&self) -> Result<Vec<u8>, Error> {
        let mut pack = PackWrite::new();
        pack.write_str_at(1, &self.path)?;
        pack.write_bool_at(2, self.valid)?;
        pack.write_str_at(3, &self.message)?;
        pack.finish()
    }

    pub fn from_pack(data: &[u8]) -> Result<Self, Error> {
        let mut pack = PackRead::new(data);
        Ok(VerifyFileResult {
            path: pack
                .read_str(1)?
                .ok_or_else(|| vault_err(ErrorClass::Format, "verify result missing path"))?,
            valid: pack.read_bool(2)?.unwrap_or(false),
            message: pack.read_str(3)?.unwrap_or_default(),
        })
    }
}

/// Decode one stored file and compare against the expected content hash.
/// Decode failures are reported as invalid, not raised: verify's job is to
/// keep going and report.
pub fn verify_file(
    storage: &Storage,
    repo_path: &str,
    expected: &str,
    subkey: Option<&CipherConfig>,
) -> Result<VerifyFileResult, Error> {
    let mut group = FilterGroup::new();
    if let Some(subkey) = subkey {
        group.push(Box::new(CipherDecryptFilter::new(subkey)));
    }
    if let Some(filter) = decompress_filter(CompressType::from_name(repo_path)) {
        group.push(filter);
    }
    group.push(Box::new(HashFilter::new(HashType::Sha1)));

    let mut read = match storage.new_read(repo_path, true, group)? {
        Some(read) => read,
        None => {
            return Ok(VerifyFileResult {
                path: repo_path.to_string(),
                valid: false,
                message: String::from("file is missing"),
            })
        }
    };

    match read.read_all() {
        Ok(_) => {
            let results = read.results()?;
            let actual = results.digest("hash").unwrap_or("").to_string();
            if actual == expected {
                Ok(VerifyFileResult {
                    path: repo_path.to_string(),
                    valid: true,
                    message: String::new(),
                })
            } else {
                Ok(VerifyFileResult {
                    path: repo_path.to_string(),
                    valid: false,
                    message: format!("checksum is '{}' but '{}' expected", actual, expected),
                })
            }
        }
        Err(err) => Ok(VerifyFileResult {
            path: repo_path.to_string(),
            valid: false,
            message: format!("unable to decode - {:#}", err),
        }),
    }
}

// One repository file queued for content verification.
struct VerifyJob {
    repo_path: String,
    expected: String,
    cipher_pass: Option<String>,
}

pub fn cmd_verify(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    let storage = repo_storage(config)?;
    let cipher = config.cipher()?;

    let mut invalid: u64 = 0;
    let mut jobs: Vec<VerifyJob> = Vec::new();

    // Archive side: every stored segment against its name-embedded hash.
    let archive_info = ArchiveInfo::load(&storage, stanza, cipher.as_ref())?;
    for entry in &archive_info.history {
        let archive_path = format!("archive/{}/{}-{}", stanza, entry.version, entry.db_id);
        for dir in storage.list(&archive_path, None, InfoLevel::Exists)? {
            if dir.name.len() != 16 || !dir.name.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            let dir_path = format!("{}/{}", archive_path, dir.name);
            for file in storage.list(&dir_path, None, InfoLevel::Exists)? {
                if let Some(expected) = crate::archive::segment_stored_checksum(&file.name) {
                    jobs.push(VerifyJob {
                        repo_path: format!("{}/{}", dir_path, file.name),
                        expected: expected.to_string(),
                        cipher_pass: archive_info.cipher_pass.clone(),
                    });
                }
            }
        }
    }

    // Backup side: the reference invariant inline, stored files queued.
    let backup_info = BackupInfo::load(&storage, stanza, cipher.as_ref())?;
    let backup_subkey = match &backup_info.cipher_pass {
        Some(pass) => Some(CipherConfig::new(pass)?),
        None => None,
    };

    for label in backup_info.labels() {
        let manifest = match Manifest::load(&storage, stanza, &label, backup_subkey.as_ref()) {
            Ok(manifest) => manifest,
            Err(err) => {
                invalid += 1;
                warn!("backup '{}' manifest is unreadable - {:#}", label, err);
                continue;
            }
        };

        // Every referenced ancestor must be registered and must list the
        // file with the same content.
        for file in manifest.files.values() {
            if let Some(reference) = &file.reference {
                let valid = backup_info.get(reference).is_some()
                    && Manifest::load(&storage, stanza, reference, backup_subkey.as_ref())
                        .ok()
                        .and_then(|ancestor| {
                            ancestor.file(&file.name).map(|ancestor_file| {
                                ancestor_file.checksum == file.checksum
                                    && ancestor_file.size == file.size
                            })
                        })
                        .unwrap_or(false);

                if !valid {
                    invalid += 1;
                    warn!(
                        "backup '{}' file '{}' references '{}' which does not store it",
                        label, file.name, reference
                    );
                }
                continue;
            }

            let extension = CompressType::parse(&manifest.compress_type)
                .unwrap_or(CompressType::None)
                .extension();
            if let Some(expected) = &file.checksum {
                jobs.push(VerifyJob {
                    repo_path: format!("backup/{}/{}/{}{}", stanza, label, file.name, extension),
                    expected: expected.clone(),
                    cipher_pass: backup_info.cipher_pass.clone(),
                });
            }
        }
    }

    let checked = jobs.len() as u64;
    let results = if config.process_max > 1 {
        verify_parallel(config, jobs)?
    } else {
        let mut results = Vec::new();
        for job in &jobs {
            let subkey = match &job.cipher_pass {
                Some(pass) => Some(CipherConfig::new(pass)?),
                None => None,
            };
            results.push(verify_file(&storage, &job.repo_path, &job.expected, subkey.as_ref())?);
        }
        results
    };

    for result in &results {
        if !result.valid {
            invalid += 1;
            warn!("invalid repository file '{}' - {}", result.path, result.message);
        }
    }

    info!("verify complete: {} files checked, {} invalid", checked, invalid);
    Ok(if invalid > 0 { 1 } else { 0 })
}

fn verify_parallel(config: &Config, jobs: Vec<VerifyJob>) -> Result<Vec<VerifyFileResult>, Error> {
    use crate::protocol::parallel::{ExecutorJob, ParallelExecutor};
    use crate::protocol::spawn;
    use serde_json::json;

    let workers = spawn::spawn_pool(config, &config.command, config.process_max)?;
    let (clients, children) = spawn::into_clients(workers);

    let mut queue: Vec<ExecutorJob> = jobs
        .into_iter()
        .map(|job| {
            ExecutorJob::new(
                job.repo_path.clone(),
                CMD_VERIFY_FILE,
                vec![
                    json!(job.repo_path),
                    json!(job.expected),
                    json!(job.cipher_pass),
                ],
            )
        })
        .collect();
    queue.reverse();

    let mut results = Vec::new();
    let mut executor =
        ParallelExecutor::new(clients, config.protocol_timeout, move || queue.pop());

    let run = executor.run(|result| {
        match result.out {
            Ok(out) => {
                let encoded = out.as_str().ok_or_else(|| {
                    vault_err(ErrorClass::Protocol, "verify-file returned no result pack")
                })?;
                let decoded =
                    VerifyFileResult::from_pack(&base64::decode(encoded).map_err(|err| {
                        vault_err(ErrorClass::Protocol, format!("invalid result pack - {}", err))
                    })?)?;
                results.push(decoded);
            }
            Err(err) => {
                // A worker failure counts against the file, not the run.
                results.push(VerifyFileResult {
                    path: result.key,
                    valid: false,
                    message: format!("{:#}", err),
                });
            }
        }
        Ok(())
    });

    let clients = executor.finish();
    drop(clients);
    spawn::reap(children);
    run?;

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::backup::cmd_backup;
    use crate::command::stanza::cmd_stanza_create;
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
        options.insert("pg-version".to_string(), "14".to_string());
        options.insert("pg-system-id".to_string(), "1000".to_string());
        options.insert("pg-catalog-version".to_string(), "202107181".to_string());
        options.insert("pg-control-version".to_string(), "1300".to_string());
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
        std::fs::create_dir_all(pg.join("base/1")).unwrap();
        std::fs::write(pg.join("PG_VERSION"), b"14\n").unwrap();
        std::fs::write(pg.join("base/1/1255"), vec![5u8; 1024]).unwrap();
    }

    #[test]
    fn clean_repository_verifies() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);
        cmd_stanza_create(&config_for(&dir, "stanza-create", &[])).unwrap();
        cmd_backup(&config_for(&dir, "backup", &[("type", "full")])).unwrap();

        assert_eq!(cmd_verify(&config_for(&dir, "verify", &[])).unwrap(), 0);
    }

    #[test]
    fn corrupted_backup_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        make_cluster(&dir);
        cmd_stanza_create(&config_for(&dir, "stanza-create", &[])).unwrap();
        cmd_backup(&config_for(&dir, "backup", &[("type", "full")])).unwrap();

        // Truncate one stored file.
        let config = config_for(&dir, "verify", &[]);
        let storage = repo_storage(&config).unwrap();
        let info = BackupInfo::load(&storage, "main", None).unwrap();
        let label = info.labels().remove(0);
        let victim = format!("backup/main/{}/pg_data/base/1/1255.gz", label);
        let mut data = storage.get(&victim, false).unwrap().unwrap();
        data.truncate(data.len() / 2);
        storage.put(&victim, &data).unwrap();

        assert_eq!(cmd_verify(&config).unwrap(), 1);
    }

    #[test]
    fn verify_result_pack_round_trip() {
        let result = VerifyFileResult {
            path: String::from("archive/main/14-1/0000000100000000/segment"),
            valid: false,
            message: String::from("checksum mismatch"),
        };
        assert_eq!(
            VerifyFileResult::from_pack(&result.to_pack().unwrap()).unwrap(),
            result
        );
    }

    #[test]
    fn missing_file_reported_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::storage::local_storage(dir.path().to_str().unwrap());
        let result = verify_file(&storage, "backup/main/x/pg_data/missing.gz", "aa", None).unwrap();
        assert!(!result.valid);
        assert_eq!(result.message, "file is missing");
    }
}
