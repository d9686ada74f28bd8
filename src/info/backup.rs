//! Backup registry (`backup.info`).
//!
//! The per-stanza list of valid backups with their attributes, plus the
//! cluster history mirroring the archive registry. The registry can be
//! reconstructed from the backup directories when it is lost: every
//! directory with a loadable manifest becomes an entry, everything else is
//! dropped with a warning.

use std::collections::BTreeMap;

use anyhow::Error;
use chrono::{Local, TimeZone};
use log::warn;
use serde_json::json;

use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::storage::{InfoLevel, Storage};

use super::manifest::Manifest;
use super::{info_load, info_save, IniDoc};

pub const BACKUP_INFO_FILE: &str = "backup.info";

const SECTION_DB: &str = "db";
const SECTION_DB_HISTORY: &str = "db:history";
const SECTION_BACKUP_CURRENT: &str = "backup:current";
const SECTION_CIPHER: &str = "cipher";
const KEY_CIPHER_PASS: &str = "cipher-pass";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    pub fn parse(value: &str) -> Result<BackupType, Error> {
        match value {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            _ => Err(vault_err(
                ErrorClass::Option,
                format!("invalid backup type '{}'", value),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }

    fn label_letter(self) -> char {
        match self {
            BackupType::Full => 'F',
            BackupType::Diff => 'D',
            BackupType::Incr => 'I',
        }
    }
}

/// Build a backup label: `YYYYMMDD-HHMMSSF` for a full backup, the full
/// label's timestamp plus `_YYYYMMDD-HHMMSS{D|I}` for a dependent one.
pub fn backup_label(backup_type: BackupType, prior: Option<&str>, time: i64) -> Result<String, Error> {
    let stamp = Local
        .timestamp_opt(time, 0)
        .single()
        .ok_or_else(|| vault_err(ErrorClass::Assert, "invalid backup timestamp"))?
        .format("%Y%m%d-%H%M%S");

    match backup_type {
        BackupType::Full => Ok(format!("{}F", stamp)),
        BackupType::Diff | BackupType::Incr => {
            let prior = prior.ok_or_else(|| {
                vault_err(ErrorClass::Assert, "dependent backup requires a prior label")
            })?;
            // Anchor on the prior's full backup part.
            let anchor = &prior[..16];
            Ok(format!("{}_{}{}", anchor, stamp, backup_type.label_letter()))
        }
    }
}

/// Parse the type letter out of a label.
pub fn label_type(label: &str) -> Result<BackupType, Error> {
    match label.chars().last() {
        Some('F') => Ok(BackupType::Full),
        Some('D') => Ok(BackupType::Diff),
        Some('I') => Ok(BackupType::Incr),
        _ => Err(vault_err(
            ErrorClass::Format,
            format!("invalid backup label '{}'", label),
        )),
    }
}

lazy_static::lazy_static! {
    static ref LABEL_REGEX: regex::Regex = regex::Regex::new(
        r"^[0-9]{8}-[0-9]{6}F(_[0-9]{8}-[0-9]{6}(D|I))?$"
    ).unwrap();
}

pub fn label_valid(label: &str) -> bool {
    LABEL_REGEX.is_match(label)
}

/// One valid backup in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupEntry {
    pub label: String,
    pub backup_type: BackupType,
    pub timestamp_start: i64,
    pub timestamp_stop: i64,
    pub archive_start: Option<String>,
    pub archive_stop: Option<String>,
    pub prior: Option<String>,
    /// Transitive ancestor chain, oldest (the full backup) first.
    pub reference: Vec<String>,
    pub size: u64,
    pub repo_size: u64,
    pub db_id: u32,
    pub compress_type: String,
}

impl BackupEntry {
    fn to_value(&self) -> serde_json::Value {
        let mut value = json!({
            "backup-type": self.backup_type.as_str(),
            "backup-timestamp-start": self.timestamp_start,
            "backup-timestamp-stop": self.timestamp_stop,
            "backup-info-size": self.size,
            "backup-info-repo-size": self.repo_size,
            "db-id": self.db_id,
            "option-compress-type": self.compress_type,
        });

        let map = value.as_object_mut().unwrap();
        if let Some(archive_start) = &self.archive_start {
            map.insert("backup-archive-start".into(), json!(archive_start));
        }
        if let Some(archive_stop) = &self.archive_stop {
            map.insert("backup-archive-stop".into(), json!(archive_stop));
        }
        if let Some(prior) = &self.prior {
            map.insert("backup-prior".into(), json!(prior));
        }
        if !self.reference.is_empty() {
            map.insert("backup-reference".into(), json!(self.reference));
        }

        value
    }

    fn from_value(label: &str, value: &serde_json::Value) -> Result<Self, Error> {
        let str_field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(String::from);
        let u64_field = |key: &str| value.get(key).and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(BackupEntry {
            label: label.to_string(),
            backup_type: BackupType::parse(
                value
                    .get("backup-type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("full"),
            )?,
            timestamp_start: value
                .get("backup-timestamp-start")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            timestamp_stop: value
                .get("backup-timestamp-stop")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            archive_start: str_field("backup-archive-start"),
            archive_stop: str_field("backup-archive-stop"),
            prior: str_field("backup-prior"),
            reference: value
                .get("backup-reference")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            size: u64_field("backup-info-size"),
            repo_size: u64_field("backup-info-repo-size"),
            db_id: u64_field("db-id") as u32,
            compress_type: str_field("option-compress-type").unwrap_or_else(|| "none".into()),
        })
    }
}

/// Cluster attributes kept per history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgBackupHistory {
    pub db_id: u32,
    pub version: String,
    pub system_id: u64,
    pub catalog_version: u32,
    pub control_version: u32,
}

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub history: Vec<PgBackupHistory>,
    pub current: BTreeMap<String, BackupEntry>,
    pub cipher_pass: Option<String>,
}

impl BackupInfo {
    pub fn new(
        version: &str,
        system_id: u64,
        catalog_version: u32,
        control_version: u32,
        cipher_pass: Option<String>,
    ) -> Self {
        BackupInfo {
            history: vec![PgBackupHistory {
                db_id: 1,
                version: version.to_string(),
                system_id,
                catalog_version,
                control_version,
            }],
            current: BTreeMap::new(),
            cipher_pass,
        }
    }

    pub fn current_pg(&self) -> &PgBackupHistory {
        self.history.last().unwrap()
    }

    pub fn upgrade(&mut self, version: &str, system_id: u64, catalog_version: u32, control_version: u32) {
        let db_id = self.current_pg().db_id + 1;
        self.history.push(PgBackupHistory {
            db_id,
            version: version.to_string(),
            system_id,
            catalog_version,
            control_version,
        });
    }

    pub fn add(&mut self, entry: BackupEntry) {
        self.current.insert(entry.label.clone(), entry);
    }

    pub fn remove(&mut self, label: &str) -> Option<BackupEntry> {
        self.current.remove(label)
    }

    pub fn get(&self, label: &str) -> Option<&BackupEntry> {
        self.current.get(label)
    }

    /// Labels in ascending (chronological) order.
    pub fn labels(&self) -> Vec<String> {
        self.current.keys().cloned().collect()
    }

    /// Most recent backup, optionally restricted by type.
    pub fn last(&self, backup_type: Option<BackupType>) -> Option<&BackupEntry> {
        self.current
            .values()
            .rev()
            .find(|entry| backup_type.map_or(true, |t| entry.backup_type == t))
    }

    /// Labels of backups that depend on the given label through their
    /// reference chain (not including the label itself).
    pub fn dependents(&self, label: &str) -> Vec<String> {
        self.current
            .values()
            .filter(|entry| entry.reference.iter().any(|r| r == label))
            .map(|entry| entry.label.clone())
            .collect()
    }

    fn to_doc(&self) -> IniDoc {
        let mut doc = IniDoc::new();
        let current = self.current_pg();

        doc.set(SECTION_DB, "db-id", json!(current.db_id));
        doc.set(SECTION_DB, "db-version", json!(current.version));
        doc.set(SECTION_DB, "db-system-id", json!(current.system_id));
        doc.set(SECTION_DB, "db-catalog-version", json!(current.catalog_version));
        doc.set(SECTION_DB, "db-control-version", json!(current.control_version));

        for entry in &self.history {
            doc.set(
                SECTION_DB_HISTORY,
                &entry.db_id.to_string(),
                json!({
                    "db-version": entry.version,
                    "db-system-id": entry.system_id,
                    "db-catalog-version": entry.catalog_version,
                    "db-control-version": entry.control_version,
                }),
            );
        }

        for (label, entry) in &self.current {
            doc.set(SECTION_BACKUP_CURRENT, label, entry.to_value());
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

            history.push(PgBackupHistory {
                db_id,
                version: entry
                    .get("db-version")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| vault_err(ErrorClass::Format, "history missing db-version"))?
                    .to_string(),
                system_id: entry.get("db-system-id").and_then(|v| v.as_u64()).unwrap_or(0),
                catalog_version: entry
                    .get("db-catalog-version")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                control_version: entry
                    .get("db-control-version")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
            });
        }

        history.sort_by_key(|entry| entry.db_id);
        if history.is_empty() {
            return Err(vault_err(ErrorClass::Format, "backup info has no history"));
        }

        let mut current = BTreeMap::new();
        for label in doc.keys(SECTION_BACKUP_CURRENT) {
            let entry = BackupEntry::from_value(&label, doc.get(SECTION_BACKUP_CURRENT, &label).unwrap())?;
            current.insert(label, entry);
        }

        Ok(BackupInfo {
            history,
            current,
            cipher_pass: doc.get_str(SECTION_CIPHER, KEY_CIPHER_PASS),
        })
    }

    pub fn path(stanza: &str) -> String {
        format!("backup/{}/{}", stanza, BACKUP_INFO_FILE)
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

    /// Load and reconcile with the backup directories actually present:
    /// entries without a loadable manifest are dropped, directories with a
    /// valid manifest but no entry are added back. Differences are saved.
    pub fn load_reconstruct(
        storage: &Storage,
        stanza: &str,
        cipher: Option<&CipherConfig>,
        subkey: Option<&CipherConfig>,
    ) -> Result<Self, Error> {
        let mut info = Self::load(storage, stanza, cipher)?;
        let mut changed = false;

        let on_disk: Vec<String> = storage
            .list(&format!("backup/{}", stanza), None, InfoLevel::Exists)?
            .into_iter()
            .filter(|entry| label_valid(&entry.name))
            .map(|entry| entry.name)
            .collect();

        // Drop registry entries whose backup directory or manifest is gone.
        let labels: Vec<String> = info.labels();
        for label in labels {
            let manifest = Manifest::load(storage, stanza, &label, subkey);
            if !on_disk.contains(&label) || manifest.is_err() {
                warn!("backup '{}' missing manifest - removed from backup.info", label);
                info.remove(&label);
                changed = true;
            }
        }

        // Add backups on disk that have a valid manifest but no entry.
        for label in on_disk {
            if info.get(&label).is_none() {
                match Manifest::load(storage, stanza, &label, subkey) {
                    Ok(manifest) => {
                        warn!("backup '{}' found in repository - added to backup.info", label);
                        info.add(manifest.to_backup_entry());
                        changed = true;
                    }
                    Err(err) => {
                        warn!("backup '{}' has no valid manifest - skipped - {:#}", label, err);
                    }
                }
            }
        }

        if changed {
            info.save(storage, stanza, cipher)?;
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::posix::PosixDriver;

    fn storage(dir: &tempfile::TempDir) -> Storage {
        Storage::new(Box::new(PosixDriver::new(false)), dir.path().to_str().unwrap())
    }

    fn entry(label: &str, prior: Option<&str>, reference: &[&str]) -> BackupEntry {
        BackupEntry {
            label: label.to_string(),
            backup_type: label_type(label).unwrap(),
            timestamp_start: 1000,
            timestamp_stop: 2000,
            archive_start: Some(String::from("000000010000000000000002")),
            archive_stop: Some(String::from("000000010000000000000004")),
            prior: prior.map(String::from),
            reference: reference.iter().map(|s| s.to_string()).collect(),
            size: 1_000_000,
            repo_size: 300_000,
            db_id: 1,
            compress_type: String::from("gz"),
        }
    }

    #[test]
    fn labels() {
        let full = backup_label(BackupType::Full, None, 1700000000).unwrap();
        assert!(label_valid(&full));
        assert_eq!(label_type(&full).unwrap(), BackupType::Full);

        let incr = backup_label(BackupType::Incr, Some(&full), 1700003600).unwrap();
        assert!(label_valid(&incr));
        assert!(incr.starts_with(&full[..16]));
        assert!(incr.ends_with('I'));

        assert!(!label_valid("20250101-010101X"));
        assert!(!label_valid("junk"));
    }

    #[test]
    fn registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let mut info = BackupInfo::new("14", 1000, 202107181, 1300, None);
        info.add(entry("20250101-000000F", None, &[]));
        info.add(entry(
            "20250101-000000F_20250102-000000D",
            Some("20250101-000000F"),
            &["20250101-000000F"],
        ));
        info.save(&storage, "main", None).unwrap();

        let loaded = BackupInfo::load(&storage, "main", None).unwrap();
        assert_eq!(loaded.labels().len(), 2);

        let diff = loaded.get("20250101-000000F_20250102-000000D").unwrap();
        assert_eq!(diff.backup_type, BackupType::Diff);
        assert_eq!(diff.prior.as_deref(), Some("20250101-000000F"));
        assert_eq!(diff.reference, vec!["20250101-000000F"]);
        assert_eq!(diff.size, 1_000_000);
    }

    #[test]
    fn last_and_dependents() {
        let mut info = BackupInfo::new("14", 1000, 202107181, 1300, None);
        info.add(entry("20250101-000000F", None, &[]));
        info.add(entry(
            "20250101-000000F_20250102-000000I",
            Some("20250101-000000F"),
            &["20250101-000000F"],
        ));
        info.add(entry("20250103-000000F", None, &[]));

        assert_eq!(info.last(None).unwrap().label, "20250103-000000F");
        assert_eq!(
            info.last(Some(BackupType::Full)).unwrap().label,
            "20250103-000000F"
        );
        assert_eq!(
            info.dependents("20250101-000000F"),
            vec!["20250101-000000F_20250102-000000I"]
        );
        assert!(info.dependents("20250103-000000F").is_empty());
    }
}
