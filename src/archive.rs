//! WAL archive support.
//!
//! Segment names are `TTTTTTTTLLLLLLLLSSSSSSSS` (timeline, log, segment in
//! hex). In the repository a segment lives under
//! `archive/<stanza>/<archive-id>/<first 16 hex>/` with its SHA-1 content
//! hash and compression extension appended:
//! `<segment>-<sha1>[.gz|.lz4]`. Timeline history files are stored verbatim
//! next to the segment directories.

use anyhow::Error;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{vault_err, ErrorClass};
use crate::storage::{InfoLevel, Storage};

pub mod get;
pub mod push;
pub mod spool;

lazy_static! {
    static ref WAL_SEGMENT_REGEX: Regex = Regex::new(r"^[0-9A-F]{24}$").unwrap();
    static ref WAL_HISTORY_REGEX: Regex = Regex::new(r"^[0-9A-F]{8}\.history$").unwrap();
}

pub fn is_wal_segment(name: &str) -> bool {
    WAL_SEGMENT_REGEX.is_match(name)
}

pub fn is_history_file(name: &str) -> bool {
    WAL_HISTORY_REGEX.is_match(name)
}

/// Timeline, log and segment fields of a segment name.
pub fn segment_split(name: &str) -> Result<(u32, u32, u32), Error> {
    if !is_wal_segment(name) {
        return Err(vault_err(
            ErrorClass::Format,
            format!("'{}' is not a valid WAL segment name", name),
        ));
    }

    Ok((
        u32::from_str_radix(&name[0..8], 16).unwrap(),
        u32::from_str_radix(&name[8..16], 16).unwrap(),
        u32::from_str_radix(&name[16..24], 16).unwrap(),
    ))
}

/// The segment that follows in WAL order on the same timeline.
pub fn segment_next(name: &str, segment_size: u64) -> Result<String, Error> {
    let (timeline, mut log, mut seg) = segment_split(name)?;
    let segments_per_log = (0x1_0000_0000u64 / segment_size) as u32;

    seg += 1;
    if seg >= segments_per_log {
        seg = 0;
        log += 1;
    }

    Ok(format!("{:08X}{:08X}{:08X}", timeline, log, seg))
}

/// Repository directory of a segment: the first 16 hex characters.
pub fn segment_dir(name: &str) -> &str {
    &name[0..16]
}

/// Repository path of the directory holding one segment.
pub fn segment_repo_dir(stanza: &str, archive_id: &str, segment: &str) -> String {
    format!("archive/{}/{}/{}", stanza, archive_id, segment_dir(segment))
}

/// Find a stored segment by name, ignoring hash and compression suffix.
/// Returns the repository path of the stored file.
pub fn segment_find(
    storage: &Storage,
    stanza: &str,
    archive_id: &str,
    segment: &str,
) -> Result<Option<String>, Error> {
    let dir = segment_repo_dir(stanza, archive_id, segment);
    let expression = Regex::new(&format!(
        "^{}-[0-9a-f]{{40}}(\\.gz|\\.lz4)?$",
        regex::escape(segment)
    ))
    .unwrap();

    let mut matches = storage.list(&dir, Some(&expression), InfoLevel::Exists)?;
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(format!("{}/{}", dir, matches.remove(0).name))),
        _ => Err(vault_err(
            ErrorClass::ArchiveDuplicate,
            format!("duplicate copies of WAL segment '{}' exist in the archive", segment),
        )),
    }
}

/// Stored file name for a segment with its content hash.
pub fn segment_store_name(segment: &str, checksum: &str, extension: &str) -> String {
    format!("{}-{}{}", segment, checksum, extension)
}

/// Extract the content hash embedded in a stored segment file name.
pub fn segment_stored_checksum(stored: &str) -> Option<&str> {
    let base = stored.rsplit('/').next()?;
    let no_ext = base.split('.').next()?;
    let (_, checksum) = no_ext.split_once('-')?;
    if checksum.len() == 40 {
        Some(checksum)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::posix::PosixDriver;

    #[test]
    fn segment_names() {
        assert!(is_wal_segment("000000010000000000000001"));
        assert!(is_wal_segment("0000000A00000001000000FF"));
        assert!(!is_wal_segment("00000001000000000000000"));
        assert!(!is_wal_segment("zzzzzzzz0000000000000001"));
        assert!(is_history_file("00000002.history"));
        assert!(!is_history_file("history"));
    }

    #[test]
    fn next_segment_16mb() {
        let size = 16 * 1024 * 1024;
        // 256 segments per log with 16MB segments.
        assert_eq!(
            segment_next("000000010000000000000001", size).unwrap(),
            "000000010000000000000002"
        );
        assert_eq!(
            segment_next("0000000100000000000000FF", size).unwrap(),
            "000000010000000100000000"
        );
    }

    #[test]
    fn next_segment_1gb() {
        let size = 1024 * 1024 * 1024;
        // Four segments per log with 1GB segments.
        assert_eq!(
            segment_next("000000010000000000000003", size).unwrap(),
            "000000010000000100000000"
        );
    }

    #[test]
    fn store_names() {
        let name = segment_store_name(
            "000000010000000000000001",
            "9b5a4f4e3f6f51b0c2b1a2d8f3e49c7b8f0a1c2d",
            ".gz",
        );
        assert_eq!(
            name,
            "000000010000000000000001-9b5a4f4e3f6f51b0c2b1a2d8f3e49c7b8f0a1c2d.gz"
        );
        assert_eq!(
            segment_stored_checksum(&name),
            Some("9b5a4f4e3f6f51b0c2b1a2d8f3e49c7b8f0a1c2d")
        );
        assert_eq!(segment_dir("000000010000000000000001"), "0000000100000000");
    }

    #[test]
    fn find_in_repository() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(
            Box::new(PosixDriver::new(false)),
            dir.path().to_str().unwrap(),
        );

        assert!(
            segment_find(&storage, "main", "14-1", "000000010000000000000001")
                .unwrap()
                .is_none()
        );

        let stored = "archive/main/14-1/0000000100000000/000000010000000000000001-9b5a4f4e3f6f51b0c2b1a2d8f3e49c7b8f0a1c2d.gz";
        storage.put(stored, b"segment").unwrap();

        assert_eq!(
            segment_find(&storage, "main", "14-1", "000000010000000000000001")
                .unwrap()
                .as_deref(),
            Some(stored)
        );

        // A second copy with a different hash is a duplicate error.
        storage
            .put(
                "archive/main/14-1/0000000100000000/000000010000000000000001-aaaa4f4e3f6f51b0c2b1a2d8f3e49c7b8f0a1c2d",
                b"other",
            )
            .unwrap();
        assert!(segment_find(&storage, "main", "14-1", "000000010000000000000001").is_err());
    }
}
