//! Backup manifest.
//!
//! The canonical inventory of one backup: every cluster file with checksum,
//! size, ownership and mtime, the paths and symlinks needed to rebuild the
//! data directory, the databases present, and the option snapshot the
//! backup was taken with. A file may carry a reference to an ancestor
//! backup, meaning "reuse the copy stored by that backup" - this is how
//! differential and incremental backups avoid storing unchanged files.
//!
//! The manifest is written last, as the backup's commit record, in the same
//! sealed primary+copy form as the info files.

use std::collections::BTreeMap;

use anyhow::Error;
use serde_json::json;

use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::storage::Storage;

use super::backup::{label_type, BackupEntry, BackupType};
use super::{info_load, info_save, IniDoc};

pub const MANIFEST_FILE: &str = "backup.manifest";

const SECTION_BACKUP: &str = "backup";
const SECTION_BACKUP_DB: &str = "backup:db";
const SECTION_BACKUP_OPTION: &str = "backup:option";
const SECTION_TARGET_FILE: &str = "target:file";
const SECTION_TARGET_PATH: &str = "target:path";
const SECTION_TARGET_LINK: &str = "target:link";
const SECTION_DB: &str = "db";

/// One cluster file in the backup.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    pub timestamp: i64,
    /// Ancestor backup storing the actual copy, None when stored here.
    pub reference: Option<String>,
    /// Block numbers that failed page checksum validation during backup.
    pub page_checksum_error: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestPath {
    pub name: String,
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestLink {
    pub name: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub label: String,
    pub backup_type: BackupType,
    pub timestamp_start: i64,
    pub timestamp_stop: i64,
    pub archive_start: Option<String>,
    pub archive_stop: Option<String>,
    pub prior: Option<String>,

    pub db_version: String,
    pub db_id: u32,
    pub db_system_id: u64,
    pub db_catalog_version: u32,

    pub compress_type: String,
    pub cipher_type: String,

    pub files: BTreeMap<String, ManifestFile>,
    pub paths: BTreeMap<String, ManifestPath>,
    pub links: BTreeMap<String, ManifestLink>,
    /// Database name to oid.
    pub databases: BTreeMap<String, u64>,
}

impl Manifest {
    pub fn new(
        label: &str,
        db_version: &str,
        db_id: u32,
        db_system_id: u64,
        db_catalog_version: u32,
    ) -> Result<Self, Error> {
        Ok(Manifest {
            label: label.to_string(),
            backup_type: label_type(label)?,
            timestamp_start: 0,
            timestamp_stop: 0,
            archive_start: None,
            archive_stop: None,
            prior: None,
            db_version: db_version.to_string(),
            db_id,
            db_system_id,
            db_catalog_version,
            compress_type: String::from("none"),
            cipher_type: String::from("none"),
            files: BTreeMap::new(),
            paths: BTreeMap::new(),
            links: BTreeMap::new(),
            databases: BTreeMap::new(),
        })
    }

    pub fn add_file(&mut self, file: ManifestFile) {
        self.files.insert(file.name.clone(), file);
    }

    pub fn add_path(&mut self, path: ManifestPath) {
        self.paths.insert(path.name.clone(), path);
    }

    pub fn add_link(&mut self, link: ManifestLink) {
        self.links.insert(link.name.clone(), link);
    }

    pub fn file(&self, name: &str) -> Option<&ManifestFile> {
        self.files.get(name)
    }

    /// Distinct ancestor labels referenced by files, sorted ascending.
    pub fn references(&self) -> Vec<String> {
        let mut references: Vec<String> = self
            .files
            .values()
            .filter_map(|file| file.reference.clone())
            .collect();
        references.sort();
        references.dedup();
        references
    }

    /// Logical cluster size: every file counted whether stored or
    /// referenced.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|file| file.size).sum()
    }

    /// Size of the files actually stored by this backup.
    pub fn stored_size(&self) -> u64 {
        self.files
            .values()
            .filter(|file| file.reference.is_none())
            .map(|file| file.size)
            .sum()
    }

    /// Registry entry equivalent, used for reconstruction.
    pub fn to_backup_entry(&self) -> BackupEntry {
        BackupEntry {
            label: self.label.clone(),
            backup_type: self.backup_type,
            timestamp_start: self.timestamp_start,
            timestamp_stop: self.timestamp_stop,
            archive_start: self.archive_start.clone(),
            archive_stop: self.archive_stop.clone(),
            prior: self.prior.clone(),
            reference: self.references(),
            size: self.total_size(),
            repo_size: self.stored_size(),
            db_id: self.db_id,
            compress_type: self.compress_type.clone(),
        }
    }

    fn to_doc(&self) -> IniDoc {
        let mut doc = IniDoc::new();

        doc.set(SECTION_BACKUP, "backup-label", json!(self.label));
        doc.set(SECTION_BACKUP, "backup-type", json!(self.backup_type.as_str()));
        doc.set(SECTION_BACKUP, "backup-timestamp-start", json!(self.timestamp_start));
        doc.set(SECTION_BACKUP, "backup-timestamp-stop", json!(self.timestamp_stop));
        if let Some(archive_start) = &self.archive_start {
            doc.set(SECTION_BACKUP, "backup-archive-start", json!(archive_start));
        }
        if let Some(archive_stop) = &self.archive_stop {
            doc.set(SECTION_BACKUP, "backup-archive-stop", json!(archive_stop));
        }
        if let Some(prior) = &self.prior {
            doc.set(SECTION_BACKUP, "backup-prior", json!(prior));
        }

        doc.set(SECTION_BACKUP_DB, "db-version", json!(self.db_version));
        doc.set(SECTION_BACKUP_DB, "db-id", json!(self.db_id));
        doc.set(SECTION_BACKUP_DB, "db-system-id", json!(self.db_system_id));
        doc.set(SECTION_BACKUP_DB, "db-catalog-version", json!(self.db_catalog_version));

        doc.set(SECTION_BACKUP_OPTION, "option-compress-type", json!(self.compress_type));
        doc.set(SECTION_BACKUP_OPTION, "option-cipher-type", json!(self.cipher_type));

        for (name, file) in &self.files {
            let mut value = json!({
                "size": file.size,
                "timestamp": file.timestamp,
                "mode": format!("{:04o}", file.mode),
            });
            let map = value.as_object_mut().unwrap();
            if let Some(checksum) = &file.checksum {
                map.insert("checksum".into(), json!(checksum));
            }
            if let Some(user) = &file.user {
                map.insert("user".into(), json!(user));
            }
            if let Some(group) = &file.group {
                map.insert("group".into(), json!(group));
            }
            if let Some(reference) = &file.reference {
                map.insert("reference".into(), json!(reference));
            }
            if !file.page_checksum_error.is_empty() {
                map.insert("checksum-page-error".into(), json!(file.page_checksum_error));
            }
            doc.set(SECTION_TARGET_FILE, name, value);
        }

        for (name, path) in &self.paths {
            let mut value = json!({"mode": format!("{:04o}", path.mode)});
            let map = value.as_object_mut().unwrap();
            if let Some(user) = &path.user {
                map.insert("user".into(), json!(user));
            }
            if let Some(group) = &path.group {
                map.insert("group".into(), json!(group));
            }
            doc.set(SECTION_TARGET_PATH, name, value);
        }

        for (name, link) in &self.links {
            doc.set(SECTION_TARGET_LINK, name, json!({"destination": link.destination}));
        }

        for (name, oid) in &self.databases {
            doc.set(SECTION_DB, name, json!({"db-id": oid}));
        }

        doc
    }

    fn from_doc(doc: &IniDoc) -> Result<Self, Error> {
        let label = doc
            .get_str(SECTION_BACKUP, "backup-label")
            .ok_or_else(|| vault_err(ErrorClass::Format, "manifest missing backup-label"))?;

        let mut manifest = Manifest::new(
            &label,
            &doc.get_str(SECTION_BACKUP_DB, "db-version")
                .ok_or_else(|| vault_err(ErrorClass::Format, "manifest missing db-version"))?,
            doc.get_u64(SECTION_BACKUP_DB, "db-id").unwrap_or(1) as u32,
            doc.get_u64(SECTION_BACKUP_DB, "db-system-id").unwrap_or(0),
            doc.get_u64(SECTION_BACKUP_DB, "db-catalog-version").unwrap_or(0) as u32,
        )?;

        manifest.timestamp_start = doc
            .get(SECTION_BACKUP, "backup-timestamp-start")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        manifest.timestamp_stop = doc
            .get(SECTION_BACKUP, "backup-timestamp-stop")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        manifest.archive_start = doc.get_str(SECTION_BACKUP, "backup-archive-start");
        manifest.archive_stop = doc.get_str(SECTION_BACKUP, "backup-archive-stop");
        manifest.prior = doc.get_str(SECTION_BACKUP, "backup-prior");
        manifest.compress_type = doc
            .get_str(SECTION_BACKUP_OPTION, "option-compress-type")
            .unwrap_or_else(|| "none".into());
        manifest.cipher_type = doc
            .get_str(SECTION_BACKUP_OPTION, "option-cipher-type")
            .unwrap_or_else(|| "none".into());

        for name in doc.keys(SECTION_TARGET_FILE) {
            let value = doc.get(SECTION_TARGET_FILE, &name).unwrap();
            manifest.add_file(ManifestFile {
                name: name.clone(),
                size: value.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
                checksum: value.get("checksum").and_then(|v| v.as_str()).map(String::from),
                mode: u32::from_str_radix(
                    value.get("mode").and_then(|v| v.as_str()).unwrap_or("0600"),
                    8,
                )
                .unwrap_or(0o600),
                user: value.get("user").and_then(|v| v.as_str()).map(String::from),
                group: value.get("group").and_then(|v| v.as_str()).map(String::from),
                timestamp: value.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
                reference: value.get("reference").and_then(|v| v.as_str()).map(String::from),
                page_checksum_error: value
                    .get("checksum-page-error")
                    .and_then(|v| v.as_array())
                    .map(|list| list.iter().filter_map(|v| v.as_u64()).collect())
                    .unwrap_or_default(),
            });
        }

        for name in doc.keys(SECTION_TARGET_PATH) {
            let value = doc.get(SECTION_TARGET_PATH, &name).unwrap();
            manifest.add_path(ManifestPath {
                name: name.clone(),
                mode: u32::from_str_radix(
                    value.get("mode").and_then(|v| v.as_str()).unwrap_or("0700"),
                    8,
                )
                .unwrap_or(0o700),
                user: value.get("user").and_then(|v| v.as_str()).map(String::from),
                group: value.get("group").and_then(|v| v.as_str()).map(String::from),
            });
        }

        for name in doc.keys(SECTION_TARGET_LINK) {
            let value = doc.get(SECTION_TARGET_LINK, &name).unwrap();
            manifest.add_link(ManifestLink {
                name: name.clone(),
                destination: value
                    .get("destination")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            });
        }

        for name in doc.keys(SECTION_DB) {
            let value = doc.get(SECTION_DB, &name).unwrap();
            manifest
                .databases
                .insert(name, value.get("db-id").and_then(|v| v.as_u64()).unwrap_or(0));
        }

        Ok(manifest)
    }

    pub fn path(stanza: &str, label: &str) -> String {
        format!("backup/{}/{}/{}", stanza, label, MANIFEST_FILE)
    }

    /// Write both manifest copies; this is the backup's commit point.
    pub fn save(
        &self,
        storage: &Storage,
        stanza: &str,
        cipher: Option<&CipherConfig>,
    ) -> Result<(), Error> {
        info_save(storage, &Self::path(stanza, &self.label), &self.to_doc(), cipher)
    }

    pub fn load(
        storage: &Storage,
        stanza: &str,
        label: &str,
        cipher: Option<&CipherConfig>,
    ) -> Result<Self, Error> {
        Self::from_doc(&info_load(storage, &Self::path(stanza, label), cipher)?)
    }
}
