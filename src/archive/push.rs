//! Single segment push: the unit of work shared by the direct archive-push
//! path and the async daemon's workers.

use std::path::Path;

use anyhow::Error;

use crate::config::Config;
use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::io::cipher::CipherEncryptFilter;
use crate::io::compress::compress_filter;
use crate::io::hash::{HashFilter, HashType};
use crate::io::size::SizeFilter;
use crate::io::FilterGroup;
use crate::pack::{PackRead, PackWrite};
use crate::storage::{Storage, WriteOptions};

use super::{is_history_file, is_wal_segment, segment_find, segment_repo_dir, segment_store_name, segment_stored_checksum};

/// Result of pushing one file, returned over the protocol as a pack.
#[derive(Debug, Clone, PartialEq)]
pub struct PushResult {
    pub file: String,
    /// Content hash; None for history files stored verbatim.
    pub checksum: Option<String>,
    pub size: u64,
    pub repo_size: u64,
    /// The segment already existed with identical content.
    pub dedup: bool,
}

impl PushResult {
    pub fn to_pack(&self) -> Result<Vec<u8>, Error> {
        let mut pack = PackWrite::new();
        pack.write_str_at(1, &self.file)?;
        match &self.checksum {
            Some(checksum) => pack.write_str_at(2, checksum)?,
            None => pack.write_null(),
        }
        pack.write_u64_at(3, self.size)?;
        pack.write_u64_at(4, self.repo_size)?;
        pack.write_bool_at(5, self.dedup)?;
        pack.finish()
    }

    pub fn from_pack(data: &[u8]) -> Result<Self, Error> {
        let mut pack = PackRead::new(data);
        Ok(PushResult {
            file: pack
                .read_str(1)?
                .ok_or_else(|| vault_err(ErrorClass::Format, "push result missing file"))?,
            checksum: pack.read_str(2)?,
            size: pack.read_u64(3)?.unwrap_or(0),
            repo_size: pack.read_u64(4)?.unwrap_or(0),
            dedup: pack.read_bool(5)?.unwrap_or(false),
        })
    }
}

/// Push one WAL segment or history file from the cluster into the archive.
///
/// Dedup contract: a segment already stored with identical content is a
/// no-op; the same name with different content is an error, since it means
/// two clusters are archiving into one stanza.
pub fn push_file(
    config: &Config,
    storage: &Storage,
    archive_info: &ArchiveInfo,
    source: &Path,
    file_name: &str,
) -> Result<PushResult, Error> {
    let archive_id = archive_info.archive_id();
    let stanza = config.stanza()?;

    let data = std::fs::read(source).map_err(|err| {
        vault_err(
            ErrorClass::FileRead,
            format!("unable to read WAL file '{}' - {}", source.display(), err),
        )
    })?;

    let subkey = match &archive_info.cipher_pass {
        Some(pass) => Some(CipherConfig::new(pass)?),
        None => None,
    };

    if is_history_file(file_name) {
        // History files are small and stored verbatim so recovery tools can
        // read them without this binary.
        let path = format!("archive/{}/{}/{}", stanza, archive_id, file_name);
        storage.put(&path, &data)?;
        return Ok(PushResult {
            file: file_name.to_string(),
            checksum: None,
            size: data.len() as u64,
            repo_size: data.len() as u64,
            dedup: false,
        });
    }

    if !is_wal_segment(file_name) {
        return Err(vault_err(
            ErrorClass::Format,
            format!("'{}' is not a WAL segment or history file", file_name),
        ));
    }

    if data.len() as u64 != config.wal_segment_size {
        return Err(vault_err(
            ErrorClass::Format,
            format!(
                "WAL segment '{}' is {} bytes but segment size is {}",
                file_name,
                data.len(),
                config.wal_segment_size
            ),
        ));
    }

    let checksum = HashFilter::digest_buf(HashType::Sha1, &data)?;

    // Dedup check against anything already stored under this name.
    if let Some(stored) = segment_find(storage, stanza, &archive_id, file_name)? {
        let stored_checksum = segment_stored_checksum(&stored);
        if stored_checksum == Some(checksum.as_str()) {
            return Ok(PushResult {
                file: file_name.to_string(),
                checksum: Some(checksum),
                size: data.len() as u64,
                repo_size: 0,
                dedup: true,
            });
        }
        return Err(vault_err(
            ErrorClass::ArchiveDuplicate,
            format!(
                "WAL segment '{}' already exists in the archive with a different checksum\n\
                 HINT: is more than one cluster archiving to this stanza?",
                file_name
            ),
        ));
    }

    let compress = config.compress()?;
    let mut group = FilterGroup::new();
    if let Some(filter) = compress_filter(compress, config.compress_level) {
        group.push(filter);
    }
    if let Some(subkey) = &subkey {
        group.push(Box::new(CipherEncryptFilter::new(subkey)?));
    }
    group.push(Box::new(SizeFilter::new()));

    let path = format!(
        "{}/{}",
        segment_repo_dir(stanza, &archive_id, file_name),
        segment_store_name(file_name, &checksum, compress.extension())
    );

    let mut write = storage.new_write(&path, &WriteOptions::default(), group)?;
    write.write(&data)?;
    let results = write.close()?;

    Ok(PushResult {
        file: file_name.to_string(),
        checksum: Some(checksum),
        size: data.len() as u64,
        repo_size: results.size("size").unwrap_or(0),
        dedup: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load, CommandLine, CommandRole};
    use crate::storage::local_storage;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut options = std::collections::HashMap::new();
        options.insert("stanza".to_string(), "main".to_string());
        options.insert(
            "repo-path".to_string(),
            dir.path().join("repo").to_str().unwrap().to_string(),
        );
        // Small segments keep the tests fast.
        options.insert("wal-segment-size".to_string(), "65536".to_string());
        options.insert("compress-type".to_string(), "gz".to_string());

        load(&CommandLine {
            command: String::from("archive-push"),
            role: CommandRole::Default,
            parameters: Vec::new(),
            config_file: Some(String::from("/nonexistent")),
            options,
        })
        .unwrap()
    }

    fn wal_file(dir: &tempfile::TempDir, name: &str, fill: u8) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![fill; 65536]).unwrap();
        path
    }

    #[test]
    fn push_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let storage = local_storage(&config.repo_path);
        let info = ArchiveInfo::new("14", 1000, None);

        let source = wal_file(&dir, "000000010000000000000001", 1);
        let result =
            push_file(&config, &storage, &info, &source, "000000010000000000000001").unwrap();

        assert!(!result.dedup);
        assert_eq!(result.size, 65536);
        assert!(result.repo_size > 0 && result.repo_size < 65536);
        let checksum = result.checksum.clone().unwrap();

        let stored = segment_find(&storage, "main", "14-1", "000000010000000000000001")
            .unwrap()
            .unwrap();
        assert!(stored.ends_with(&format!("000000010000000000000001-{}.gz", checksum)));

        // Identical content: no-op.
        let again =
            push_file(&config, &storage, &info, &source, "000000010000000000000001").unwrap();
        assert!(again.dedup);
        assert_eq!(again.checksum.as_deref(), Some(checksum.as_str()));

        // Different content under the same name: error.
        let clash = wal_file(&dir, "clash", 2);
        let err = push_file(&config, &storage, &info, &clash, "000000010000000000000001")
            .unwrap_err();
        assert_eq!(
            crate::error::error_class(&err),
            crate::error::ErrorClass::ArchiveDuplicate
        );
    }

    #[test]
    fn wrong_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let storage = local_storage(&config.repo_path);
        let info = ArchiveInfo::new("14", 1000, None);

        let path = dir.path().join("short");
        std::fs::write(&path, b"too short").unwrap();
        assert!(push_file(&config, &storage, &info, &path, "000000010000000000000009").is_err());
    }

    #[test]
    fn history_file_stored_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let storage = local_storage(&config.repo_path);
        let info = ArchiveInfo::new("14", 1000, None);

        let path = dir.path().join("00000002.history");
        std::fs::write(&path, b"1\t0/3000000\tat restore\n").unwrap();

        let result = push_file(&config, &storage, &info, &path, "00000002.history").unwrap();
        assert_eq!(result.checksum, None);

        let stored = storage
            .get("archive/main/14-1/00000002.history", false)
            .unwrap()
            .unwrap();
        assert_eq!(stored, b"1\t0/3000000\tat restore\n");
    }

    #[test]
    fn encrypted_push_round_trips_through_pack() {
        let result = PushResult {
            file: String::from("000000010000000000000001"),
            checksum: Some(String::from("aa".repeat(20))),
            size: 16777216,
            repo_size: 1048576,
            dedup: false,
        };

        let pack = result.to_pack().unwrap();
        assert_eq!(PushResult::from_pack(&pack).unwrap(), result);

        let miss = PushResult {
            file: String::from("00000002.history"),
            checksum: None,
            size: 100,
            repo_size: 100,
            dedup: true,
        };
        assert_eq!(PushResult::from_pack(&miss.to_pack().unwrap()).unwrap(), miss);
    }
}
