//! Single segment fetch: the unit of work shared by the direct archive-get
//! path and the prefetch daemon's workers.

use std::path::Path;

use anyhow::Error;

use crate::config::Config;
use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::io::cipher::CipherDecryptFilter;
use crate::io::compress::{decompress_filter, CompressType};
use crate::io::hash::{HashFilter, HashType};
use crate::io::FilterGroup;
use crate::pack::{PackRead, PackWrite};
use crate::storage::Storage;

use super::{is_history_file, segment_find, segment_stored_checksum};

/// Result of fetching one file, returned over the protocol as a pack.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub file: String,
    pub found: bool,
    pub size: u64,
}

impl GetResult {
    pub fn to_pack(&self) -> Result<Vec<u8>, Error> {
        let mut pack = PackWrite::new();
        pack.write_str_at(1, &self.file)?;
        pack.write_bool_at(2, self.found)?;
        pack.write_u64_at(3, self.size)?;
        pack.finish()
    }

    pub fn from_pack(data: &[u8]) -> Result<Self, Error> {
        let mut pack = PackRead::new(data);
        Ok(GetResult {
            file: pack
                .read_str(1)?
                .ok_or_else(|| vault_err(ErrorClass::Format, "get result missing file"))?,
            found: pack.read_bool(2)?.unwrap_or(false),
            size: pack.read_u64(3)?.unwrap_or(0),
        })
    }
}

/// Fetch a WAL segment or history file into `dest`. Ok(result) with
/// `found=false` when the archive does not have it - a normal condition
/// during recovery, not an error.
///
/// The stored content hash is verified while decoding; a mismatch means the
/// archive copy is corrupt and fails the fetch.
pub fn get_file(
    config: &Config,
    storage: &Storage,
    archive_info: &ArchiveInfo,
    file_name: &str,
    dest: &Path,
) -> Result<GetResult, Error> {
    let stanza = config.stanza()?;

    let subkey = match &archive_info.cipher_pass {
        Some(pass) => Some(CipherConfig::new(pass)?),
        None => None,
    };

    if is_history_file(file_name) {
        // Check the current archive directory first, then older ones.
        for entry in archive_info.history.iter().rev() {
            let path = format!(
                "archive/{}/{}-{}/{}",
                stanza, entry.version, entry.db_id, file_name
            );
            if let Some(data) = storage.get(&path, true)? {
                write_dest(dest, &data)?;
                return Ok(GetResult {
                    file: file_name.to_string(),
                    found: true,
                    size: data.len() as u64,
                });
            }
        }

        return Ok(GetResult {
            file: file_name.to_string(),
            found: false,
            size: 0,
        });
    }

    // Search newest cluster first: after a stanza-upgrade the requested
    // segment may still live under the previous archive id.
    for entry in archive_info.history.iter().rev() {
        let archive_id = format!("{}-{}", entry.version, entry.db_id);
        let stored = match segment_find(storage, stanza, &archive_id, file_name)? {
            Some(stored) => stored,
            None => continue,
        };

        let expected = segment_stored_checksum(&stored).map(String::from);

        let mut group = FilterGroup::new();
        if let Some(subkey) = &subkey {
            group.push(Box::new(CipherDecryptFilter::new(subkey)));
        }
        if let Some(filter) = decompress_filter(CompressType::from_name(&stored)) {
            group.push(filter);
        }
        group.push(Box::new(HashFilter::new(HashType::Sha1)));

        // Tolerate a concurrent expire between find and open.
        let mut read = match storage.new_read(&stored, true, group)? {
            Some(read) => read,
            None => continue,
        };
        let data = read.read_all()?;
        let results = read.results()?;

        if let Some(expected) = expected {
            let actual = results.digest("hash").unwrap_or("");
            if actual != expected {
                return Err(vault_err(
                    ErrorClass::Checksum,
                    format!(
                        "WAL segment '{}' checksum is '{}' but '{}' was expected - archive copy is corrupt",
                        file_name, actual, expected
                    ),
                ));
            }
        }

        write_dest(dest, &data)?;
        return Ok(GetResult {
            file: file_name.to_string(),
            found: true,
            size: data.len() as u64,
        });
    }

    Ok(GetResult {
        file: file_name.to_string(),
        found: false,
        size: 0,
    })
}

fn write_dest(dest: &Path, data: &[u8]) -> Result<(), Error> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            vault_err(
                ErrorClass::FileWrite,
                format!("unable to create '{}' - {}", parent.display(), err),
            )
        })?;
    }

    // Write through a temp name so recovery never sees a partial segment.
    let tmp = dest.with_extension("pgvault.tmp");
    std::fs::write(&tmp, data).map_err(|err| {
        vault_err(
            ErrorClass::FileWrite,
            format!("unable to write '{}' - {}", tmp.display(), err),
        )
    })?;
    std::fs::rename(&tmp, dest).map_err(|err| {
        vault_err(
            ErrorClass::FileWrite,
            format!("unable to move '{}' to '{}' - {}", tmp.display(), dest.display(), err),
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::push::push_file;
    use crate::config::{load, CommandLine, CommandRole};
    use crate::storage::local_storage;

    fn test_config(dir: &tempfile::TempDir, cipher: bool) -> Config {
        let mut options = std::collections::HashMap::new();
        options.insert("stanza".to_string(), "main".to_string());
        options.insert(
            "repo-path".to_string(),
            dir.path().join("repo").to_str().unwrap().to_string(),
        );
        options.insert("wal-segment-size".to_string(), "65536".to_string());
        options.insert("compress-type".to_string(), "lz4".to_string());
        if cipher {
            options.insert("repo-cipher-type".to_string(), "aes-256-cbc".to_string());
            options.insert("repo-cipher-pass".to_string(), "user-pass".to_string());
        }

        load(&CommandLine {
            command: String::from("archive-get"),
            role: CommandRole::Default,
            parameters: Vec::new(),
            config_file: Some(String::from("/nonexistent")),
            options,
        })
        .unwrap()
    }

    fn round_trip(cipher: bool) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, cipher);
        let storage = local_storage(&config.repo_path);
        let subkey = if cipher {
            Some(crate::crypt::generate_passphrase().unwrap())
        } else {
            None
        };
        let info = ArchiveInfo::new("14", 1000, subkey);

        let segment = "000000010000000000000001";
        let source = dir.path().join(segment);
        let payload: Vec<u8> = (0..65536u32).map(|v| (v % 251) as u8).collect();
        std::fs::write(&source, &payload).unwrap();

        push_file(&config, &storage, &info, &source, segment).unwrap();

        let dest = dir.path().join("pg_wal").join("RECOVERYXLOG");
        let result = get_file(&config, &storage, &info, segment, &dest).unwrap();

        assert!(result.found);
        assert_eq!(result.size, 65536);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[test]
    fn push_then_get() {
        round_trip(false);
    }

    #[test]
    fn push_then_get_encrypted() {
        round_trip(true);
    }

    #[test]
    fn missing_segment_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, false);
        let storage = local_storage(&config.repo_path);
        let info = ArchiveInfo::new("14", 1000, None);

        let dest = dir.path().join("out");
        let result =
            get_file(&config, &storage, &info, "0000000100000000000000AA", &dest).unwrap();
        assert!(!result.found);
        assert!(!dest.exists());
    }

    #[test]
    fn corrupt_archive_copy_detected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, false);
        let storage = local_storage(&config.repo_path);
        let info = ArchiveInfo::new("14", 1000, None);

        let segment = "000000010000000000000001";
        let source = dir.path().join(segment);
        std::fs::write(&source, vec![7u8; 65536]).unwrap();
        push_file(&config, &storage, &info, &source, segment).unwrap();

        // Rewrite the stored file with different content under the same
        // hash-bearing name.
        let stored = segment_find(&storage, "main", "14-1", segment).unwrap().unwrap();
        let mut group = FilterGroup::new();
        group.push(crate::io::compress::compress_filter(CompressType::Lz4, 6).unwrap());
        let mut out = Vec::new();
        group.process(&vec![9u8; 65536], true, &mut out).unwrap();
        storage.put(&stored, &out).unwrap();

        let dest = dir.path().join("out");
        let err = get_file(&config, &storage, &info, segment, &dest).unwrap_err();
        assert_eq!(crate::error::error_class(&err), ErrorClass::Checksum);
    }

    #[test]
    fn get_result_pack_round_trip() {
        let result = GetResult {
            file: String::from("000000010000000000000001"),
            found: true,
            size: 16777216,
        };
        assert_eq!(GetResult::from_pack(&result.to_pack().unwrap()).unwrap(), result);
    }

    #[test]
    fn searches_older_archive_ids() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, false);
        let storage = local_storage(&config.repo_path);

        let mut info = ArchiveInfo::new("13", 500, None);
        let segment = "000000010000000000000001";
        let source = dir.path().join(segment);
        std::fs::write(&source, vec![3u8; 65536]).unwrap();
        push_file(&config, &storage, &info, &source, segment).unwrap();

        // After an upgrade the segment still resolves through history.
        info.upgrade("14", 1000);
        let dest = dir.path().join("out");
        let result = get_file(&config, &storage, &info, segment, &dest).unwrap();
        assert!(result.found);
    }
}
