//! Spool queue for asynchronous archiving.
//!
//! The spool lives on local storage under
//! `<spool-path>/archive/<stanza>/{in,out}/`. The `out` queue carries
//! segments waiting to be pushed plus their status files; the `in` queue
//! holds prefetched segments for recovery. Status files mark per-segment
//! outcomes: `<segment>.ok` for success (or a benign miss on the get side),
//! `<segment>.error` with code and message for failure. A bare `error` file
//! reports a daemon that died before dispatching any segment.
//!
//! The queue is single-producer single-consumer: the synchronous command
//! writes one end, the async daemon the other, and removal races are
//! tolerated by ignoring missing files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::config::Config;
use crate::error::VaultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolDirection {
    In,
    Out,
}

impl SpoolDirection {
    fn as_str(self) -> &'static str {
        match self {
            SpoolDirection::In => "in",
            SpoolDirection::Out => "out",
        }
    }
}

/// Per-segment outcome recorded in the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SpoolStatus {
    Ok,
    Error { code: i32, message: String },
}

pub fn spool_dir(config: &Config, stanza: &str, direction: SpoolDirection) -> PathBuf {
    PathBuf::from(&config.spool_path)
        .join("archive")
        .join(stanza)
        .join(direction.as_str())
}

pub fn spool_create(config: &Config, stanza: &str, direction: SpoolDirection) -> Result<PathBuf, Error> {
    let dir = spool_dir(config, stanza, direction);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("unable to create spool path '{}'", dir.display()))?;
    Ok(dir)
}

fn status_path(dir: &Path, segment: &str, ok: bool) -> PathBuf {
    dir.join(format!("{}.{}", segment, if ok { "ok" } else { "error" }))
}

/// Read a segment's status. None when no outcome is recorded yet.
pub fn status_read(dir: &Path, segment: &str) -> Result<Option<SpoolStatus>, Error> {
    if status_path(dir, segment, true).exists() {
        return Ok(Some(SpoolStatus::Ok));
    }

    let error_path = status_path(dir, segment, false);
    match std::fs::read_to_string(&error_path) {
        Ok(contents) => {
            let (code, message) = contents.split_once('\n').unwrap_or(("99", ""));
            Ok(Some(SpoolStatus::Error {
                code: code.trim().parse().unwrap_or(99),
                message: message.trim().to_string(),
            }))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow::format_err!(
            "unable to read status '{}' - {}",
            error_path.display(),
            err
        )),
    }
}

pub fn status_write_ok(dir: &Path, segment: &str) -> Result<(), Error> {
    let path = status_path(dir, segment, true);
    // The ok file replaces any prior error for the segment.
    let _ = std::fs::remove_file(status_path(dir, segment, false));
    std::fs::write(&path, b"").with_context(|| format!("unable to write '{}'", path.display()))?;
    Ok(())
}

pub fn status_write_error(dir: &Path, segment: &str, err: &Error) -> Result<(), Error> {
    let path = status_path(dir, segment, false);
    let code = crate::error::exit_code(err);
    std::fs::write(&path, format!("{}\n{}", code, err))
        .with_context(|| format!("unable to write '{}'", path.display()))?;
    Ok(())
}

/// Remove a segment's status files; missing files are fine.
pub fn status_clear(dir: &Path, segment: &str) -> Result<(), Error> {
    let _ = std::fs::remove_file(status_path(dir, segment, true));
    let _ = std::fs::remove_file(status_path(dir, segment, false));
    Ok(())
}

/// Write the global error marker for a daemon that aborted before
/// dispatching per-segment work.
pub fn global_error_write(dir: &Path, err: &Error) {
    let path = dir.join("error");
    let code = crate::error::exit_code(err);
    let _ = std::fs::write(path, format!("{}\n{}", code, err));
}

pub fn global_error_clear(dir: &Path) {
    let _ = std::fs::remove_file(dir.join("error"));
}

/// Read the global daemon error, if one is recorded.
pub fn global_error_read(dir: &Path) -> Option<SpoolStatus> {
    let contents = std::fs::read_to_string(dir.join("error")).ok()?;
    let (code, message) = contents.split_once('\n').unwrap_or(("99", ""));
    Some(SpoolStatus::Error {
        code: code.trim().parse().unwrap_or(99),
        message: message.trim().to_string(),
    })
}

/// Re-raise a recorded error status as a local error.
pub fn status_raise(status: &SpoolStatus) -> Result<(), Error> {
    if let SpoolStatus::Error { code, message } = status {
        return Err(VaultError::remote(*code, message.clone(), None).into());
    }
    Ok(())
}

/// List queue entries of one kind: plain segment data files (no status
/// suffix), sorted ascending.
pub fn queue_list(dir: &Path) -> Result<Vec<String>, Error> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(anyhow::format_err!(
                "unable to list spool '{}' - {}",
                dir.display(),
                err
            ))
        }
    };

    let mut result = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(".ok") || name.ends_with(".error") || name == "error" {
            continue;
        }
        result.push(name);
    }

    result.sort();
    Ok(result)
}

/// The ideal prefetch queue for recovery: the requested segment and its
/// successors, bounded by the queue byte budget.
pub fn ideal_queue(first: &str, segment_size: u64, queue_max: u64) -> Result<Vec<String>, Error> {
    let count = (queue_max / segment_size).max(1);
    let mut queue = vec![first.to_string()];

    while (queue.len() as u64) < count {
        let next = super::segment_next(queue.last().unwrap(), segment_size)?;
        queue.push(next);
    }

    Ok(queue)
}
