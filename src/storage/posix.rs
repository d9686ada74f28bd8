//! Local filesystem driver.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use nix::unistd::{chown, Gid, Group, Uid, User};
use regex::Regex;

use crate::error::{vault_err, ErrorClass};
use crate::io::RawWrite;
use crate::storage::{
    FileType, InfoLevel, StorageDriver, StorageFeature, StorageInfo, WriteOptions,
};

const PATH_MODE_DEFAULT: u32 = 0o750;
const FILE_MODE_DEFAULT: u32 = 0o640;

/// Posix driver. When `sync` is set every write is fsynced and renames are
/// followed by a directory sync, which is required for repository writes to
/// survive a crash.
pub struct PosixDriver {
    sync: bool,
}

impl PosixDriver {
    pub fn new(sync: bool) -> Self {
        PosixDriver { sync }
    }

    fn stat_info(path: &Path, name: String, level: InfoLevel) -> Result<Option<StorageInfo>, Error> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format_err!("unable to stat '{}' - {}", path.display(), err)),
        };

        let file_type = if meta.is_dir() {
            FileType::Path
        } else if meta.file_type().is_symlink() {
            FileType::Link
        } else if meta.is_file() {
            FileType::File
        } else {
            FileType::Special
        };

        let mut info = StorageInfo {
            name,
            file_type,
            size: if file_type == FileType::File { meta.len() } else { 0 },
            mode: None,
            user: None,
            group: None,
            modification_time: None,
            link_target: None,
        };

        if level >= InfoLevel::Basic {
            info.modification_time = Some(meta.mtime());
        }

        if level >= InfoLevel::Detail {
            info.mode = Some(meta.permissions().mode() & 0o7777);
            info.user = User::from_uid(Uid::from_raw(meta.uid()))
                .ok()
                .flatten()
                .map(|u| u.name);
            info.group = Group::from_gid(Gid::from_raw(meta.gid()))
                .ok()
                .flatten()
                .map(|g| g.name);

            if file_type == FileType::Link {
                info.link_target = fs::read_link(path)
                    .ok()
                    .map(|t| t.to_string_lossy().into_owned());
            }
        }

        Ok(Some(info))
    }
}

impl StorageDriver for PosixDriver {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn features(&self) -> StorageFeature {
        StorageFeature::PATH
            | StorageFeature::COMPRESS
            | StorageFeature::HARDLINK
            | StorageFeature::INFO_DETAIL
            | StorageFeature::SYMLINK
    }

    fn info(&self, path: &str, level: InfoLevel) -> Result<Option<StorageInfo>, Error> {
        let name = path.rsplit('/').next().unwrap_or("").to_string();
        Self::stat_info(Path::new(path), name, level)
    }

    fn list(
        &self,
        path: &str,
        expression: Option<&Regex>,
        level: InfoLevel,
    ) -> Result<Vec<StorageInfo>, Error> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(format_err!("unable to list '{}' - {}", path, err)),
        };

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("unable to list '{}'", path))?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if let Some(expression) = expression {
                if !expression.is_match(&name) {
                    continue;
                }
            }

            if let Some(info) = Self::stat_info(&entry.path(), name, level)? {
                result.push(info);
            }
        }

        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn new_read(
        &self,
        path: &str,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Option<Box<dyn Read>>, Error> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format_err!("unable to open '{}' - {}", path, err)),
        };

        if let Some(offset) = offset {
            file.seek(SeekFrom::Start(offset))
                .with_context(|| format!("unable to seek '{}'", path))?;
        }

        match limit {
            Some(limit) => Ok(Some(Box::new(file.take(limit)))),
            None => Ok(Some(Box::new(file))),
        }
    }

    fn new_write(&self, path: &str, options: &WriteOptions) -> Result<Box<dyn RawWrite>, Error> {
        let final_path = PathBuf::from(path);

        if options.create_path {
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("unable to create path '{}'", parent.display()))?;
            }
        }

        let write_path = if options.atomic {
            PathBuf::from(format!("{}.tmp", path))
        } else {
            final_path.clone()
        };

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(options.mode.unwrap_or(FILE_MODE_DEFAULT))
            .open(&write_path)
            .map_err(|err| {
                vault_err(
                    ErrorClass::FileWrite,
                    format!("unable to open '{}' for write - {}", write_path.display(), err),
                )
            })?;

        Ok(Box::new(PosixWrite {
            file: Some(file),
            write_path,
            final_path,
            atomic: options.atomic,
            sync: self.sync,
            user: options.user.clone(),
            group: options.group.clone(),
            modification_time: options.modification_time,
        }))
    }

    fn path_create(
        &self,
        path: &str,
        mode: Option<u32>,
        error_on_exists: bool,
        recurse: bool,
    ) -> Result<(), Error> {
        let result = if recurse {
            fs::create_dir_all(path)
        } else {
            fs::create_dir(path)
        };

        match result {
            Ok(()) => {
                fs::set_permissions(
                    path,
                    fs::Permissions::from_mode(mode.unwrap_or(PATH_MODE_DEFAULT)),
                )?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && !error_on_exists => {
                Ok(())
            }
            Err(err) => Err(format_err!("unable to create path '{}' - {}", path, err)),
        }
    }

    fn path_remove(&self, path: &str, recurse: bool) -> Result<(), Error> {
        let result = if recurse {
            fs::remove_dir_all(path)
        } else {
            fs::remove_dir(path)
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(format_err!("unable to remove path '{}' - {}", path, err)),
        }
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if error_on_missing {
                    Err(vault_err(
                        ErrorClass::FileMissing,
                        format!("unable to remove '{}' - file is missing", path),
                    ))
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(format_err!("unable to remove '{}' - {}", path, err)),
        }
    }

    fn move_file(&self, from: &str, to: &str) -> Result<(), Error> {
        if let Some(parent) = Path::new(to).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to).map_err(|err| format_err!("unable to move '{}' to '{}' - {}", from, to, err))?;

        if self.sync {
            if let Some(parent) = Path::new(to).parent() {
                sync_path(parent)?;
            }
        }
        Ok(())
    }
}

fn sync_path(path: &Path) -> Result<(), Error> {
    let dir = File::open(path)
        .map_err(|err| format_err!("unable to open '{}' for sync - {}", path.display(), err))?;
    dir.sync_all()
        .map_err(|err| format_err!("unable to sync '{}' - {}", path.display(), err))?;
    Ok(())
}

struct PosixWrite {
    file: Option<File>,
    write_path: PathBuf,
    final_path: PathBuf,
    atomic: bool,
    sync: bool,
    user: Option<String>,
    group: Option<String>,
    modification_time: Option<i64>,
}

impl RawWrite for PosixWrite {
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| vault_err(ErrorClass::Assert, "write already closed"))?;
        file.write_all(data).map_err(|err| {
            vault_err(
                ErrorClass::FileWrite,
                format!("unable to write '{}' - {}", self.write_path.display(), err),
            )
        })?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let file = self
            .file
            .take()
            .ok_or_else(|| vault_err(ErrorClass::Assert, "write already closed"))?;

        if self.sync {
            file.sync_all().map_err(|err| {
                format_err!("unable to sync '{}' - {}", self.write_path.display(), err)
            })?;
        }
        drop(file);

        if self.user.is_some() || self.group.is_some() {
            let uid = match &self.user {
                Some(name) => User::from_name(name)?.map(|u| u.uid),
                None => None,
            };
            let gid = match &self.group {
                Some(name) => Group::from_name(name)?.map(|g| g.gid),
                None => None,
            };
            chown(&self.write_path, uid, gid)
                .map_err(|err| format_err!("unable to chown '{}' - {}", self.write_path.display(), err))?;
        }

        if let Some(mtime) = self.modification_time {
            let tv = TimeVal::new(mtime, 0);
            utimes(&self.write_path, &tv, &tv)
                .map_err(|err| format_err!("unable to set time on '{}' - {}", self.write_path.display(), err))?;
        }

        if self.atomic {
            fs::rename(&self.write_path, &self.final_path).map_err(|err| {
                vault_err(
                    ErrorClass::FileWrite,
                    format!(
                        "unable to move '{}' to '{}' - {}",
                        self.write_path.display(),
                        self.final_path.display(),
                        err
                    ),
                )
            })?;

            if self.sync {
                if let Some(parent) = self.final_path.parent() {
                    sync_path(parent)?;
                }
            }
        }

        Ok(())
    }
}

impl Drop for PosixWrite {
    fn drop(&mut self) {
        // An abandoned atomic write leaves no trace of the final file.
        if self.file.take().is_some() && self.atomic {
            let _ = fs::remove_file(&self.write_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Storage, WriteOptions};

    fn storage(dir: &tempfile::TempDir) -> Storage {
        Storage::new(Box::new(PosixDriver::new(false)), dir.path().to_str().unwrap())
    }

    #[test]
    fn atomic_write_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let mut write = storage
            .new_write("stanza/backup.info", &WriteOptions::default(), crate::io::FilterGroup::new())
            .unwrap();
        write.write(b"0123456789").unwrap();

        // Before close only the temp file exists.
        assert!(!dir.path().join("stanza/backup.info").exists());
        assert!(dir.path().join("stanza/backup.info.tmp").exists());

        write.close().unwrap();

        assert!(!dir.path().join("stanza/backup.info.tmp").exists());
        let info = storage
            .info("stanza/backup.info", InfoLevel::Basic)
            .unwrap()
            .unwrap();
        assert_eq!(info.size, 10);
    }

    #[test]
    fn abandoned_write_leaves_prior_version() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage.put("file", b"old").unwrap();

        {
            let mut write = storage
                .new_write("file", &WriteOptions::default(), crate::io::FilterGroup::new())
                .unwrap();
            write.write(b"new data never committed").unwrap();
            // Dropped without close.
        }

        assert_eq!(storage.get("file", false).unwrap().unwrap(), b"old");
        assert!(!dir.path().join("file.tmp").exists());
    }

    #[test]
    fn list_with_expression() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage.put("seg/000000010000000000000001-aa.gz", b"x").unwrap();
        storage.put("seg/000000010000000000000002-bb.gz", b"x").unwrap();
        storage.put("seg/0000000a.history", b"x").unwrap();

        let expression = Regex::new(r"^[0-9A-F]{24}").unwrap();
        let names: Vec<String> = storage
            .list("seg", Some(&expression), InfoLevel::Exists)
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();

        assert_eq!(
            names,
            vec![
                "000000010000000000000001-aa.gz",
                "000000010000000000000002-bb.gz"
            ]
        );
    }

    #[test]
    fn remove_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage.remove("gone", false).unwrap();
        assert!(storage.remove("gone", true).is_err());
    }

    #[test]
    fn detail_info() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage.put("f", b"abc").unwrap();
        let info = storage.info("f", InfoLevel::Detail).unwrap().unwrap();
        assert_eq!(info.file_type, FileType::File);
        assert_eq!(info.size, 3);
        assert!(info.mode.is_some());
        assert!(info.modification_time.is_some());
    }
}
