//! Archive registry (`archive.info`).
//!
//! Tracks the PostgreSQL history for the stanza's WAL archive: an ordered
//! list of (db-id, version, system-id) entries with the newest entry
//! describing the current cluster. The archive id `<version>-<dbId>` names
//! the directory WAL for that cluster lands in.

use anyhow::Error;
use serde_json::json;

use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::storage::Storage;

use super::{info_load, info_save, IniDoc};

pub const ARCHIVE_INFO_FILE: &str = "archive.info";

const SECTION_DB: &str = "db";
const SECTION_DB_HISTORY: &str = "db:history";
const SECTION_CIPHER: &str = "cipher";
const KEY_CIPHER_PASS: &str = "cipher-pass";

/// One cluster in the stanza's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgHistory {
    pub db_id: u32,
    pub version: String,
    pub system_id: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    /// Ascending db-id; the last entry is the current cluster.
    pub history: Vec<PgHistory>,
    /// Subkey protecting archive payloads when the repo is encrypted.
    pub cipher_pass: Option<String>,
}

impl ArchiveInfo {
    pub fn new(version: &str, system_id: u64, cipher_pass: Option<String>) -> Self {
        ArchiveInfo {
            history: vec![PgHistory {
                db_id: 1,
                version: version.to_string(),
                system_id,
            }],
            cipher_pass,
        }
    }

    pub fn current(&self) -> &PgHistory {
        // Construction guarantees at least one entry.
        self.history.last().unwrap()
    }

    /// Register a new cluster after stanza-upgrade. Db ids stay dense and
    /// strictly increasing.
    pub fn upgrade(&mut self, version: &str, system_id: u64) {
        let db_id = self.current().db_id + 1;
        self.history.push(PgHistory {
            db_id,
            version: version.to_string(),
            system_id,
        });
    }

    /// Directory name WAL is archived under for the current cluster.
    pub fn archive_id(&self) -> String {
        let current = self.current();
        format!("{}-{}", current.version, current.db_id)
    }

    /// Archive id for a given cluster, newest match first.
    pub fn archive_id_for(&self, version: &str, system_id: u64) -> Result<String, Error> {
        for entry in self.history.iter().rev() {
            if entry.version == version && entry.system_id == system_id {
                return Ok(format!("{}-{}", entry.version, entry.db_id));
            }
        }

        Err(vault_err(
            ErrorClass::BackupMismatch,
            format!(
                "cluster {} (version {}) is not in the archive history",
                system_id, version
            ),
        ))
    }

    /// Check that the given cluster matches the current history entry.
    pub fn check(&self, version: &str, system_id: u64) -> Result<(), Error> {
        let current = self.current();
        if current.version != version || current.system_id != system_id {
            return Err(vault_err(
                ErrorClass::BackupMismatch,
                format!(
                    "cluster version {} system-id {} does not match stanza version {} system-id {}\n\
                     HINT: did the cluster change? run stanza-upgrade",
                    version, system_id, current.version, current.system_id
                ),
            ));
        }
        Ok(())
    }

    fn to_doc(&self) -> IniDoc {
        let mut doc = IniDoc::new();
        let current = self.current();

        doc.set(SECTION_DB, "db-id", json!(current.db_id));
        doc.set(SECTION_DB, "db-version", json!(current.version));
        doc.set(SECTION_DB, "db-system-id", json!(current.system_id));

        for entry in &self.history {
            doc.set(
                SECTION_DB_HISTORY,
                &entry.db_id.to_string(),
                json!({"db-version": entry.version, "db-system-id": entry.system_id}),
            );
        }

        if let Some(pass) = &self.cipher_pass {
            doc.set(SECTION_CIPHER, KEY_CIPHER_PASS, json!(pass));
        }

        doc
    }

    fn from_doc(doc: &IniDoc) -> Result<Self, Error> {
        let mut history = Vec::new();

        for key in doc.keys(SECTION_DB_HISTORY) {
            let db_id: u32 = key
                .parse()
                .map_err(|_| vault_err(ErrorClass::Format, format!("invalid db-id '{}'", key)))?;
            let entry = doc.get(SECTION_DB_HISTORY, &key).unwrap();

            history.push(PgHistory {
                db_id,
                version: entry
                    .get("db-version")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| vault_err(ErrorClass::Format, "history missing db-version"))?
                    .to_string(),
                system_id: entry
                    .get("db-system-id")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| vault_err(ErrorClass::Format, "history missing db-system-id"))?,
            });
        }

        history.sort_by_key(|entry| entry.db_id);
        if history.is_empty() {
            return Err(vault_err(ErrorClass::Format, "archive info has no history"));
        }

        Ok(ArchiveInfo {
            history,
            cipher_pass: doc.get_str(SECTION_CIPHER, KEY_CIPHER_PASS),
        })
    }

    pub fn path(stanza: &str) -> String {
        format!("archive/{}/{}", stanza, ARCHIVE_INFO_FILE)
    }

    pub fn save(
        &self,
        storage: &Storage,
        stanza: &str,
        cipher: Option<&CipherConfig>,
    ) -> Result<(), Error> {
        info_save(storage, &Self::path(stanza), &self.to_doc(), cipher)
    }

    pub fn load(
        storage: &Storage,
        stanza: &str,
        cipher: Option<&CipherConfig>,
    ) -> Result<Self, Error> {
        Self::from_doc(&info_load(storage, &Self::path(stanza), cipher)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::posix::PosixDriver;

    fn storage(dir: &tempfile::TempDir) -> Storage {
        Storage::new(Box::new(PosixDriver::new(false)), dir.path().to_str().unwrap())
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let info = ArchiveInfo::new("9.4", 6569239123849665679, None);
        info.save(&storage, "main", None).unwrap();

        let loaded = ArchiveInfo::load(&storage, "main", None).unwrap();
        assert_eq!(loaded.current().db_id, 1);
        assert_eq!(loaded.current().version, "9.4");
        assert_eq!(loaded.current().system_id, 6569239123849665679);
        assert_eq!(loaded.archive_id(), "9.4-1");
    }

    #[test]
    fn upgrade_appends_history() {
        let mut info = ArchiveInfo::new("14", 1000, None);
        info.upgrade("15", 2000);

        assert_eq!(info.history.len(), 2);
        assert_eq!(info.current().db_id, 2);
        assert_eq!(info.archive_id(), "15-2");

        // Older clusters remain addressable.
        assert_eq!(info.archive_id_for("14", 1000).unwrap(), "14-1");
        assert!(info.archive_id_for("13", 999).is_err());
    }

    #[test]
    fn check_mismatch() {
        let info = ArchiveInfo::new("14", 1000, None);
        assert!(info.check("14", 1000).is_ok());
        assert!(info.check("15", 1000).is_err());
        assert!(info.check("14", 1001).is_err());
    }
}
