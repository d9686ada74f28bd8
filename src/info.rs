//! Stanza info files and the backup manifest.
//!
//! These are INI-like documents: `[section]` headers with `key=JSON-value`
//! lines, sections and keys sorted so the serialized form is deterministic.
//! A trailing `[backrest]` section carries the SHA-1 of everything before it
//! and seals the file. Each document is persisted twice (`file` and
//! `file.copy`): the load path tries the primary, falls back to the copy on
//! checksum or parse failure with a warning, and reports a single
//! missing-or-corrupt error when both are unusable.

use std::collections::BTreeMap;

use anyhow::Error;
use log::warn;
use serde_json::Value;

use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::io::hash::{HashFilter, HashType};
use crate::storage::Storage;

pub mod archive;
pub mod backup;
pub mod manifest;

/// Suffix of the redundant copy.
pub const INFO_COPY_EXT: &str = ".copy";

// Section name and key of the checksum seal.
const CHECKSUM_SECTION: &str = "backrest";
const CHECKSUM_KEY: &str = "checksum";

/// A sorted section/key/JSON-value document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniDoc {
    sections: BTreeMap<String, BTreeMap<String, Value>>,
}

impl IniDoc {
    pub fn new() -> Self {
        IniDoc::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)
    }

    pub fn get_str(&self, section: &str, key: &str) -> Option<String> {
        self.get(section, key)?.as_str().map(String::from)
    }

    pub fn get_u64(&self, section: &str, key: &str) -> Option<u64> {
        self.get(section, key)?.as_u64()
    }

    pub fn remove(&mut self, section: &str, key: &str) -> Option<Value> {
        self.sections.get_mut(section)?.remove(key)
    }

    pub fn remove_section(&mut self, section: &str) {
        self.sections.remove(section);
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Keys of one section in sorted order.
    pub fn keys(&self, section: &str) -> Vec<String> {
        match self.sections.get(section) {
            Some(section) => section.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn section_names(&self) -> Vec<String> {
        self.sections.keys().cloned().collect()
    }

    /// Serialize with the trailing checksum seal.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut body = String::new();

        for (name, section) in &self.sections {
            if name == CHECKSUM_SECTION {
                continue;
            }
            body.push('[');
            body.push_str(name);
            body.push_str("]\n");
            for (key, value) in section {
                body.push_str(key);
                body.push('=');
                body.push_str(&value.to_string());
                body.push('\n');
            }
            body.push('\n');
        }

        let checksum = HashFilter::digest_buf(HashType::Sha1, body.as_bytes())?;
        let mut out = body.into_bytes();
        out.extend_from_slice(format!("[{}]\n{}=\"{}\"\n", CHECKSUM_SECTION, CHECKSUM_KEY, checksum).as_bytes());
        Ok(out)
    }

    /// Parse and verify the checksum seal.
    pub fn from_bytes(data: &[u8]) -> Result<IniDoc, Error> {
        let text = std::str::from_utf8(data)
            .map_err(|_| vault_err(ErrorClass::Format, "info file is not valid utf-8"))?;

        // The seal covers every byte before its section header.
        let seal_at = text
            .find(&format!("[{}]\n", CHECKSUM_SECTION))
            .ok_or_else(|| vault_err(ErrorClass::Checksum, "info file checksum is missing"))?;
        let body = &text[..seal_at];

        let mut doc = IniDoc::new();
        let mut current: Option<String> = None;
        let mut expected: Option<String> = None;
        let mut in_seal = false;

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].to_string();
                in_seal = name == CHECKSUM_SECTION;
                current = Some(name);
                continue;
            }

            let (key, raw) = line.split_once('=').ok_or_else(|| {
                vault_err(ErrorClass::Format, format!("invalid info line '{}'", line))
            })?;
            let value: Value = serde_json::from_str(raw).map_err(|_| {
                vault_err(ErrorClass::Format, format!("invalid info value '{}'", raw))
            })?;

            if in_seal {
                if key == CHECKSUM_KEY {
                    expected = value.as_str().map(String::from);
                }
                continue;
            }

            let section = current.as_ref().ok_or_else(|| {
                vault_err(ErrorClass::Format, "info content before any section")
            })?;
            doc.set(section, key, value);
        }

        let expected =
            expected.ok_or_else(|| vault_err(ErrorClass::Checksum, "info file checksum is missing"))?;
        let actual = HashFilter::digest_buf(HashType::Sha1, body.as_bytes())?;

        if expected != actual {
            return Err(vault_err(
                ErrorClass::Checksum,
                format!("info checksum is '{}' but expected '{}'", actual, expected),
            ));
        }

        Ok(doc)
    }
}

/// Write a document to `path` and `path.copy`, optionally encrypted.
pub fn info_save(
    storage: &Storage,
    path: &str,
    doc: &IniDoc,
    cipher: Option<&CipherConfig>,
) -> Result<(), Error> {
    let mut data = doc.to_bytes()?;
    if let Some(cipher) = cipher {
        data = cipher.encrypt(&data)?;
    }

    storage.put(path, &data)?;
    storage.put(&format!("{}{}", path, INFO_COPY_EXT), &data)?;
    Ok(())
}

fn info_load_one(
    storage: &Storage,
    path: &str,
    cipher: Option<&CipherConfig>,
) -> Result<Option<IniDoc>, Error> {
    let data = match storage.get(path, true)? {
        Some(data) => data,
        None => return Ok(None),
    };

    let data = match cipher {
        Some(cipher) => cipher.decrypt(&data)?,
        None => data,
    };

    Ok(Some(IniDoc::from_bytes(&data)?))
}

/// Load a document, falling back to the copy when the primary is corrupt
/// or missing.
pub fn info_load(
    storage: &Storage,
    path: &str,
    cipher: Option<&CipherConfig>,
) -> Result<IniDoc, Error> {
    let primary = info_load_one(storage, path, cipher);

    match primary {
        Ok(Some(doc)) => return Ok(doc),
        Ok(None) => {}
        Err(err) => warn!("invalid '{}' - {:#} - trying copy", path, err),
    }

    let copy_path = format!("{}{}", path, INFO_COPY_EXT);
    match info_load_one(storage, &copy_path, cipher) {
        Ok(Some(doc)) => Ok(doc),
        Ok(None) | Err(_) => Err(vault_err(
            ErrorClass::FileMissing,
            format!(
                "unable to load info file '{}' or '{}' - file is missing or corrupt\n\
                 HINT: has the stanza been created?",
                path, copy_path
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::posix::PosixDriver;
    use serde_json::json;

    fn storage(dir: &tempfile::TempDir) -> Storage {
        Storage::new(Box::new(PosixDriver::new(false)), dir.path().to_str().unwrap())
    }

    fn sample_doc() -> IniDoc {
        let mut doc = IniDoc::new();
        doc.set("db", "db-id", json!(1));
        doc.set("db", "db-version", json!("9.4"));
        doc.set("db", "db-system-id", json!(6569239123849665679u64));
        doc.set(
            "db:history",
            "1",
            json!({"db-version": "9.4", "db-system-id": 6569239123849665679u64}),
        );
        doc
    }

    #[test]
    fn serialize_is_deterministic_and_sealed() {
        let doc = sample_doc();
        let bytes = doc.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();

        // Sections and keys sorted, seal at the end.
        assert!(text.starts_with("[db]\ndb-id=1\n"));
        assert!(text.contains("[db:history]\n1="));
        assert!(text.trim_end().lines().last().unwrap().starts_with("checksum=\""));

        assert_eq!(doc.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let doc = sample_doc();

        info_save(&storage, "archive/main/archive.info", &doc, None).unwrap();
        assert!(storage.exists("archive/main/archive.info.copy").unwrap());

        let loaded = info_load(&storage, "archive/main/archive.info", None).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(loaded.get_u64("db", "db-system-id"), Some(6569239123849665679));
    }

    #[test]
    fn any_flipped_byte_fails_checksum() {
        let doc = sample_doc();
        let bytes = doc.to_bytes().unwrap();

        // Flip a content byte (not inside the seal itself).
        let mut corrupt = bytes.clone();
        corrupt[10] ^= 0x01;
        let err = IniDoc::from_bytes(&corrupt).unwrap_err();
        let class = crate::error::error_class(&err);
        assert!(class == ErrorClass::Checksum || class == ErrorClass::Format);
    }

    #[test]
    fn primary_corruption_falls_back_to_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let doc = sample_doc();

        info_save(&storage, "backup/main/backup.info", &doc, None).unwrap();

        // Corrupt one byte of the primary.
        let mut data = storage.get("backup/main/backup.info", false).unwrap().unwrap();
        data[5] ^= 0xff;
        storage.put("backup/main/backup.info", &data).unwrap();

        let loaded = info_load(&storage, "backup/main/backup.info", None).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn both_corrupt_is_single_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let doc = sample_doc();

        info_save(&storage, "backup/main/backup.info", &doc, None).unwrap();
        storage.put("backup/main/backup.info", b"garbage").unwrap();
        storage.put("backup/main/backup.info.copy", b"garbage").unwrap();

        let err = info_load(&storage, "backup/main/backup.info", None).unwrap_err();
        assert_eq!(crate::error::error_class(&err), ErrorClass::FileMissing);
    }

    #[test]
    fn missing_both_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        assert!(info_load(&storage, "backup/main/backup.info", None).is_err());
    }

    #[test]
    fn encrypted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let cipher = CipherConfig::new("secret").unwrap();
        let doc = sample_doc();

        info_save(&storage, "archive/main/archive.info", &doc, Some(&cipher)).unwrap();

        // Ciphertext on disk.
        let raw = storage.get("archive/main/archive.info", false).unwrap().unwrap();
        assert!(!raw.starts_with(b"[db]"));

        let loaded = info_load(&storage, "archive/main/archive.info", Some(&cipher)).unwrap();
        assert_eq!(loaded, doc);

        let wrong = CipherConfig::new("other").unwrap();
        assert!(info_load(&storage, "archive/main/archive.info", Some(&wrong)).is_err());
    }
}
