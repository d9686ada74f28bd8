//! Repository storage abstraction.
//!
//! A storage presents a uniform tree of files over one of several backends:
//! local posix, S3, Azure blob, or a remote host reached over the protocol
//! layer. Drivers implement the object operations; the [`Storage`] facade
//! adds path discipline, filter group wiring, and convenience helpers.
//!
//! Writes are atomic by default: the driver stages to a `.tmp` sibling and
//! renames on close, so a reader never observes a partial file. Object
//! stores satisfy this naturally since an incomplete upload is never
//! visible.

use std::collections::VecDeque;
use std::io::Read;

use anyhow::Error;
use regex::Regex;

use crate::error::{vault_err, ErrorClass};
use crate::io::{FilterGroup, FilteredRead, FilteredWrite, RawWrite};

pub mod azure;
pub mod posix;
pub mod remote;
pub mod s3;

bitflags::bitflags! {
    /// Capabilities a driver advertises; callers branch on these only when
    /// a fallback exists (e.g. hardlink-less incremental backups copy).
    pub struct StorageFeature: u32 {
        const PATH              = 0x01;
        const COMPRESS          = 0x02;
        const HARDLINK          = 0x04;
        const INFO_DETAIL       = 0x08;
        const SYMLINK           = 0x10;
        const ENCRYPTED_AT_REST = 0x20;
    }
}

/// How much of an info record the caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InfoLevel {
    Exists,
    Basic,
    Detail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Path,
    Link,
    Special,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Path => "path",
            FileType::Link => "link",
            FileType::Special => "special",
        }
    }
}

/// Metadata for one stored object.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub modification_time: Option<i64>,
    pub link_target: Option<String>,
}

impl StorageInfo {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        StorageInfo {
            name: name.into(),
            file_type: FileType::File,
            size,
            mode: None,
            user: None,
            group: None,
            modification_time: None,
            link_target: None,
        }
    }

    pub fn path(name: impl Into<String>) -> Self {
        StorageInfo {
            name: name.into(),
            file_type: FileType::Path,
            size: 0,
            mode: None,
            user: None,
            group: None,
            modification_time: None,
            link_target: None,
        }
    }
}

/// Options for a new write.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub atomic: bool,
    pub create_path: bool,
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub modification_time: Option<i64>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            atomic: true,
            create_path: true,
            mode: None,
            user: None,
            group: None,
            modification_time: None,
        }
    }
}

/// Backend object operations. Paths are absolute within the backend (the
/// facade resolves repository-relative paths before calling).
pub trait StorageDriver {
    fn name(&self) -> &'static str;

    fn features(&self) -> StorageFeature;

    /// Metadata for one object, None when it does not exist.
    fn info(&self, path: &str, level: InfoLevel) -> Result<Option<StorageInfo>, Error>;

    /// Single level listing, sorted by name. Missing paths list as empty.
    /// Pagination (object store continuation tokens) is handled inside the
    /// driver.
    fn list(
        &self,
        path: &str,
        expression: Option<&Regex>,
        level: InfoLevel,
    ) -> Result<Vec<StorageInfo>, Error>;

    /// Open a raw read stream. None when the object does not exist.
    fn new_read(
        &self,
        path: &str,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Option<Box<dyn Read>>, Error>;

    /// Open a raw write sink; data becomes visible at close.
    fn new_write(&self, path: &str, options: &WriteOptions) -> Result<Box<dyn RawWrite>, Error>;

    fn path_create(
        &self,
        path: &str,
        mode: Option<u32>,
        error_on_exists: bool,
        recurse: bool,
    ) -> Result<(), Error>;

    fn path_remove(&self, path: &str, recurse: bool) -> Result<(), Error>;

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), Error>;

    /// Rename where the backend supports it, copy and delete otherwise.
    fn move_file(&self, from: &str, to: &str) -> Result<(), Error>;
}

/// Storage facade bound to a base path within a driver.
pub struct Storage {
    driver: Box<dyn StorageDriver>,
    base: String,
}

impl Storage {
    pub fn new(driver: Box<dyn StorageDriver>, base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') && base.len() > 1 {
            base.pop();
        }
        Storage { driver, base }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn features(&self) -> StorageFeature {
        self.driver.features()
    }

    pub fn base_path(&self) -> &str {
        &self.base
    }

    /// Resolve a repository-relative path against the base. Rejects any
    /// attempt to escape with dot segments.
    pub fn resolve(&self, path: &str) -> Result<String, Error> {
        if path.split('/').any(|part| part == ".." || part == ".") {
            return Err(vault_err(
                ErrorClass::Assert,
                format!("invalid repository path '{}'", path),
            ));
        }

        let path = path.trim_start_matches('/');
        if path.is_empty() {
            Ok(self.base.clone())
        } else {
            Ok(format!("{}/{}", self.base, path))
        }
    }

    pub fn exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self
            .driver
            .info(&self.resolve(path)?, InfoLevel::Exists)?
            .is_some())
    }

    pub fn info(&self, path: &str, level: InfoLevel) -> Result<Option<StorageInfo>, Error> {
        self.driver.info(&self.resolve(path)?, level)
    }

    pub fn list(
        &self,
        path: &str,
        expression: Option<&Regex>,
        level: InfoLevel,
    ) -> Result<Vec<StorageInfo>, Error> {
        self.driver.list(&self.resolve(path)?, expression, level)
    }

    /// Recursive listing; names are reported relative to `path` with `/`
    /// separators, depth first so that callers may delete as they go.
    pub fn list_recursive(&self, path: &str, level: InfoLevel) -> Result<Vec<StorageInfo>, Error> {
        let mut result = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(String::new());

        while let Some(prefix) = queue.pop_front() {
            let full = if prefix.is_empty() {
                path.to_string()
            } else {
                format!("{}/{}", path, prefix)
            };

            for mut info in self.list(&full, None, level)? {
                let name = if prefix.is_empty() {
                    info.name.clone()
                } else {
                    format!("{}/{}", prefix, info.name)
                };

                if info.file_type == FileType::Path {
                    queue.push_back(name.clone());
                }

                info.name = name;
                result.push(info);
            }
        }

        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    /// Open a filtered read. None when missing and `ignore_missing`;
    /// otherwise a missing file is a FileMissing error.
    pub fn new_read(
        &self,
        path: &str,
        ignore_missing: bool,
        group: FilterGroup,
    ) -> Result<Option<FilteredRead>, Error> {
        match self.driver.new_read(&self.resolve(path)?, None, None)? {
            Some(source) => Ok(Some(FilteredRead::new(source, group))),
            None if ignore_missing => Ok(None),
            None => Err(vault_err(
                ErrorClass::FileMissing,
                format!("unable to open '{}' for read - file is missing", path),
            )),
        }
    }

    /// Open a filtered write with the given options.
    pub fn new_write(
        &self,
        path: &str,
        options: &WriteOptions,
        group: FilterGroup,
    ) -> Result<FilteredWrite, Error> {
        let sink = self.driver.new_write(&self.resolve(path)?, options)?;
        Ok(FilteredWrite::new(sink, group))
    }

    /// Read a whole file. None when missing and `ignore_missing`.
    pub fn get(&self, path: &str, ignore_missing: bool) -> Result<Option<Vec<u8>>, Error> {
        match self.new_read(path, ignore_missing, FilterGroup::new())? {
            Some(mut read) => Ok(Some(read.read_all()?)),
            None => Ok(None),
        }
    }

    /// Write a whole file atomically.
    pub fn put(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        let mut write = self.new_write(path, &WriteOptions::default(), FilterGroup::new())?;
        write.write(data)?;
        write.close()?;
        Ok(())
    }

    pub fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), Error> {
        self.driver.remove(&self.resolve(path)?, error_on_missing)
    }

    pub fn path_create(&self, path: &str, mode: Option<u32>, recurse: bool) -> Result<(), Error> {
        self.driver
            .path_create(&self.resolve(path)?, mode, false, recurse)
    }

    pub fn path_remove(&self, path: &str, recurse: bool) -> Result<(), Error> {
        self.driver.path_remove(&self.resolve(path)?, recurse)
    }

    pub fn move_file(&self, from: &str, to: &str) -> Result<(), Error> {
        self.driver.move_file(&self.resolve(from)?, &self.resolve(to)?)
    }
}

/// Build the repository storage for the resolved configuration: a remote
/// server when a repository host is set, otherwise the configured backend.
pub fn repo_storage(config: &crate::config::Config) -> Result<Storage, Error> {
    use crate::config::CommandRole;

    if config.repo_host.is_some() && config.role != CommandRole::Remote {
        let worker = crate::protocol::spawn::spawn_remote(config, &config.command)?;
        // The server process exits when the client closes the pipes; the
        // child handle is dropped without killing it.
        let driver = remote::RemoteDriver::new(worker.client)?;
        return Ok(Storage::new(Box::new(driver), config.repo_path.clone()));
    }

    match config.repo_type.as_str() {
        "posix" => Ok(Storage::new(
            Box::new(posix::PosixDriver::new(true)),
            config.repo_path.clone(),
        )),
        "s3" => {
            let s3 = s3::S3Config {
                bucket: require_option(&config.repo_s3_bucket, "repo-s3-bucket")?,
                region: require_option(&config.repo_s3_region, "repo-s3-region")?,
                endpoint: config.repo_s3_endpoint.clone(),
                key: config.repo_s3_key.clone(),
                key_secret: config.repo_s3_key_secret.clone(),
                token: config.repo_s3_token.clone(),
            };
            Ok(Storage::new(
                Box::new(s3::S3Driver::new(&s3)?),
                config.repo_path.clone(),
            ))
        }
        "azure" => {
            let azure = azure::AzureConfig {
                account: require_option(&config.repo_azure_account, "repo-azure-account")?,
                container: require_option(&config.repo_azure_container, "repo-azure-container")?,
                key: config.repo_azure_key.clone(),
                sas_token: config.repo_azure_sas.clone(),
            };
            Ok(Storage::new(
                Box::new(azure::AzureDriver::new(&azure)?),
                config.repo_path.clone(),
            ))
        }
        other => Err(vault_err(
            ErrorClass::Option,
            format!("invalid repo-type '{}'", other),
        )),
    }
}

/// Local posix storage rooted at an arbitrary path (cluster data dir,
/// spool), without repo write syncing.
pub fn local_storage(base: &str) -> Storage {
    Storage::new(Box::new(posix::PosixDriver::new(false)), base)
}

fn require_option(value: &Option<String>, name: &str) -> Result<String, Error> {
    value.clone().ok_or_else(|| {
        vault_err(
            ErrorClass::Option,
            format!("option '{}' is required for this repo type", name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::posix::PosixDriver;
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> Storage {
        Storage::new(
            Box::new(PosixDriver::new(false)),
            dir.path().to_str().unwrap(),
        )
    }

    #[test]
    fn path_discipline() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        assert!(storage.resolve("a/../b").is_err());
        assert!(storage.resolve("./a").is_err());
        assert_eq!(
            storage.resolve("archive/main").unwrap(),
            format!("{}/archive/main", dir.path().display())
        );
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage.put("backup/main/backup.info", b"contents").unwrap();
        assert_eq!(
            storage.get("backup/main/backup.info", false).unwrap().unwrap(),
            b"contents"
        );
        assert!(storage.get("backup/main/missing", true).unwrap().is_none());
        assert!(storage.get("backup/main/missing", false).is_err());
    }

    #[test]
    fn recursive_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage.put("a/one", b"1").unwrap();
        storage.put("a/b/two", b"22").unwrap();
        storage.put("three", b"333").unwrap();

        let names: Vec<String> = storage
            .list_recursive("", InfoLevel::Basic)
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();

        assert_eq!(names, vec!["a", "a/b", "a/b/two", "a/one", "three"]);
    }
}
