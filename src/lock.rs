//! Per-stanza advisory locks and stop files.
//!
//! Mutating commands take an exclusive flock on
//! `<lock-path>/<stanza>-<type>.lock` with the holder's PID inside.
//! Acquisition never blocks: a conflict reports the holder so the operator
//! can see which process owns the stanza. The lock releases on every exit
//! path since the descriptor closes with the process.
//!
//! Stop files (`<lock-path>/all.stop`, `<lock-path>/<stanza>.stop`) cause
//! commands to refuse to run; `stop --force` also clears stale locks.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Error};
use nix::fcntl::{flock, FlockArg};
use std::os::unix::io::AsRawFd;

use crate::error::{vault_err, ErrorClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Archive,
    Backup,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Archive => "archive",
            LockType::Backup => "backup",
        }
    }
}

/// A held lock; dropping it releases the flock.
#[derive(Debug)]
pub struct Lock {
    _file: File,
    pub path: PathBuf,
}

pub fn lock_file_path(lock_path: &str, stanza: &str, lock_type: LockType) -> PathBuf {
    PathBuf::from(lock_path).join(format!("{}-{}.lock", stanza, lock_type.as_str()))
}

/// Take the stanza lock without blocking. A conflict reports the holder's
/// PID from the lock file.
pub fn acquire(lock_path: &str, stanza: &str, lock_type: LockType) -> Result<Lock, Error> {
    fs::create_dir_all(lock_path)
        .with_context(|| format!("unable to create lock path '{}'", lock_path))?;

    let path = lock_file_path(lock_path, stanza, lock_type);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(|err| {
            vault_err(
                ErrorClass::LockAcquire,
                format!("unable to open lock file '{}' - {}", path.display(), err),
            )
        })?;

    if flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
        let mut holder = String::new();
        let _ = file.read_to_string(&mut holder);
        let holder = holder.trim();

        return Err(vault_err(
            ErrorClass::LockAcquire,
            if holder.is_empty() {
                format!("unable to acquire {} lock for stanza '{}'", lock_type.as_str(), stanza)
            } else {
                format!(
                    "unable to acquire {} lock for stanza '{}' - held by process {}",
                    lock_type.as_str(),
                    stanza,
                    holder
                )
            },
        ));
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;

    Ok(Lock { _file: file, path })
}

fn stop_paths(lock_path: &str, stanza: Option<&str>) -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(lock_path).join("all.stop")];
    if let Some(stanza) = stanza {
        paths.push(PathBuf::from(lock_path).join(format!("{}.stop", stanza)));
    }
    paths
}

/// Fail when a stop file covers this stanza (or everything).
pub fn stop_check(lock_path: &str, stanza: Option<&str>) -> Result<(), Error> {
    for path in stop_paths(lock_path, stanza) {
        if path.exists() {
            return Err(vault_err(
                ErrorClass::Stop,
                format!("stop file '{}' exists - remove with the start command", path.display()),
            ));
        }
    }
    Ok(())
}

/// Write the stop file for a stanza, or the global one.
pub fn stop_set(lock_path: &str, stanza: Option<&str>) -> Result<PathBuf, Error> {
    fs::create_dir_all(lock_path)
        .with_context(|| format!("unable to create lock path '{}'", lock_path))?;

    let path = stop_paths(lock_path, stanza).pop().unwrap();
    File::create(&path).with_context(|| format!("unable to create '{}'", path.display()))?;
    Ok(path)
}

/// Remove the stop file; missing is not an error (already started).
pub fn stop_clear(lock_path: &str, stanza: Option<&str>) -> Result<bool, Error> {
    let path = stop_paths(lock_path, stanza).pop().unwrap();
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(anyhow::format_err!("unable to remove '{}' - {}", path.display(), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_class;

    #[test]
    fn acquire_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().to_str().unwrap();

        let lock = acquire(lock_path, "main", LockType::Archive).unwrap();
        assert!(lock.path.exists());

        // Same (stanza, type) conflicts within this process group.
        // flock is per open file description, so re-opening in the same
        // process does conflict the same way another process would.
        let err = acquire(lock_path, "main", LockType::Archive).unwrap_err();
        assert_eq!(error_class(&err), ErrorClass::LockAcquire);
        assert!(err.to_string().contains(&std::process::id().to_string()));

        // A different lock type is independent.
        acquire(lock_path, "main", LockType::Backup).unwrap();
        // So is another stanza.
        acquire(lock_path, "other", LockType::Archive).unwrap();
    }

    #[test]
    fn release_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().to_str().unwrap();

        {
            let _lock = acquire(lock_path, "main", LockType::Backup).unwrap();
        }
        acquire(lock_path, "main", LockType::Backup).unwrap();
    }

    #[test]
    fn stop_files() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().to_str().unwrap();

        stop_check(lock_path, Some("main")).unwrap();

        stop_set(lock_path, Some("main")).unwrap();
        let err = stop_check(lock_path, Some("main")).unwrap_err();
        assert_eq!(error_class(&err), ErrorClass::Stop);
        // Other stanzas unaffected.
        stop_check(lock_path, Some("other")).unwrap();

        assert!(stop_clear(lock_path, Some("main")).unwrap());
        assert!(!stop_clear(lock_path, Some("main")).unwrap());
        stop_check(lock_path, Some("main")).unwrap();

        // Global stop covers everything.
        stop_set(lock_path, None).unwrap();
        assert!(stop_check(lock_path, Some("other")).is_err());
        assert!(stop_check(lock_path, None).is_err());
    }
}
