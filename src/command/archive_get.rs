//! Archive-get command.
//!
//! PostgreSQL's restore_command asks for one segment at a time. Direct mode
//! fetches it inline; exit code 1 (not an error) tells recovery the archive
//! does not have it. Async mode serves the request from the prefetch queue
//! and keeps the queue topped up with the next segments in WAL order,
//! dropping anything outside the ideal range so the horizon follows the
//! active recovery position.

use std::time::{Duration, Instant};

use anyhow::Error;
use log::{info, warn};
use serde_json::json;

use crate::archive::get::{get_file, GetResult};
use crate::archive::spool::{
    ideal_queue, queue_list, spool_create, status_clear, status_raise, status_read,
    status_write_error, status_write_ok, SpoolDirection, SpoolStatus,
};
use crate::archive::is_wal_segment;
use crate::config::{CommandLine, Config};
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::lock::{acquire, stop_check, LockType};
use crate::protocol::parallel::{ExecutorJob, ParallelExecutor};
use crate::protocol::spawn;
use crate::storage::repo_storage;

use super::local::CMD_ARCHIVE_GET_FILE;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn cmd_archive_get(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    stop_check(&config.lock_path, Some(stanza))?;

    let segment = cli.parameters.first().ok_or_else(|| {
        vault_err(ErrorClass::Option, "WAL segment name is required by archive-get")
    })?;
    let dest = cli.parameters.get(1).ok_or_else(|| {
        vault_err(ErrorClass::Option, "destination path is required by archive-get")
    })?;
    let dest = super::local::wal_source_path(config, dest)?;

    if !config.archive_async || !is_wal_segment(segment) {
        let storage = repo_storage(config)?;
        let cipher = config.cipher()?;
        let archive_info = ArchiveInfo::load(&storage, stanza, cipher.as_ref())?;

        let result = get_file(config, &storage, &archive_info, segment, &dest)?;
        return Ok(report(segment, &result));
    }

    // Async mode: serve from the prefetch queue.
    let in_dir = spool_create(config, stanza, SpoolDirection::In)?;
    let deadline = Instant::now() + config.archive_timeout;
    let mut forked = false;

    loop {
        let prefetched = in_dir.join(segment);
        if prefetched.exists() {
            std::fs::copy(&prefetched, &dest).map_err(|err| {
                vault_err(
                    ErrorClass::FileWrite,
                    format!("unable to deliver WAL file '{}' - {}", segment, err),
                )
            })?;
            let _ = std::fs::remove_file(&prefetched);
            status_clear(&in_dir, segment)?;

            info!("found '{}' in the prefetch queue", segment);
            return Ok(0);
        }

        match status_read(&in_dir, segment)? {
            Some(SpoolStatus::Ok) => {
                // The daemon checked: the archive does not have it yet.
                status_clear(&in_dir, segment)?;
                info!("unable to find '{}' in the archive", segment);
                return Ok(1);
            }
            Some(status @ SpoolStatus::Error { .. }) => {
                status_clear(&in_dir, segment)?;
                status_raise(&status)?;
            }
            None => {}
        }

        if !forked {
            spawn::spawn_async(cli, "archive-get")?;
            forked = true;
        }

        if Instant::now() >= deadline {
            warn!(
                "unable to resolve '{}' within {}ms - returning not found",
                segment,
                config.archive_timeout.as_millis()
            );
            return Ok(1);
        }

        std::thread::sleep(STATUS_POLL_INTERVAL);
    }
}

fn report(segment: &str, result: &GetResult) -> i32 {
    if result.found {
        info!("found '{}' in the archive", segment);
        0
    } else {
        info!("unable to find '{}' in the archive", segment);
        1
    }
}

/// Prefetch daemon: reconcile the spool with the ideal queue and fetch
/// what is missing through the worker pool.
pub fn cmd_archive_get_async(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    let stanza = config.stanza()?;

    let _lock = match acquire(&config.lock_path, stanza, LockType::Archive) {
        Ok(lock) => lock,
        Err(_) => return Ok(0),
    };

    let first = cli.parameters.first().ok_or_else(|| {
        vault_err(ErrorClass::Option, "WAL segment name is required by archive-get:async")
    })?;
    if !is_wal_segment(first) {
        return Err(vault_err(
            ErrorClass::Format,
            format!("'{}' is not a WAL segment name", first),
        ));
    }

    let in_dir = spool_create(config, stanza, SpoolDirection::In)?;
    let ideal = ideal_queue(first, config.wal_segment_size, config.archive_get_queue_max)?;

    // Drop spool entries that recovery has moved past (or will not need);
    // the ideal queue is the only retention policy here.
    for name in queue_list(&in_dir)? {
        if !ideal.contains(&name) {
            let _ = std::fs::remove_file(in_dir.join(&name));
            status_clear(&in_dir, &name)?;
        }
    }

    let need: Vec<String> = ideal
        .iter()
        .filter(|segment| {
            !in_dir.join(segment.as_str()).exists()
                && status_read(&in_dir, segment).ok().flatten().is_none()
        })
        .cloned()
        .collect();

    if need.is_empty() {
        return Ok(0);
    }
    info!("prefetching {} WAL files starting at {}", need.len(), first);

    let workers = spawn::spawn_pool(config, "archive-get", config.process_max)?;
    let (clients, children) = spawn::into_clients(workers);

    let in_dir_jobs = in_dir.clone();
    let mut jobs: Vec<ExecutorJob> = need
        .iter()
        .map(|segment| {
            ExecutorJob::new(
                segment.clone(),
                CMD_ARCHIVE_GET_FILE,
                vec![
                    json!(segment),
                    json!(in_dir_jobs.join(segment).to_str()),
                ],
            )
            .retry(1, Duration::from_secs(1))
        })
        .collect();
    jobs.reverse();

    let mut executor =
        ParallelExecutor::new(clients, config.protocol_timeout, move || jobs.pop());

    let run = executor.run(|result| {
        match result.out {
            Ok(out) => {
                let found = out
                    .as_str()
                    .and_then(|encoded| base64::decode(encoded).ok())
                    .and_then(|pack| GetResult::from_pack(&pack).ok())
                    .map(|r| r.found)
                    .unwrap_or(false);

                if found {
                    info!("prefetched WAL file '{}'", result.key);
                } else {
                    // Mark the miss so the synchronous side stops waiting.
                    status_write_ok(&in_dir, &result.key)?;
                }
            }
            Err(err) => {
                warn!("unable to prefetch WAL file '{}' - {:#}", result.key, err);
                status_write_error(&in_dir, &result.key, &err)?;
            }
        }
        Ok(())
    });

    let clients = executor.finish();
    drop(clients);
    spawn::reap(children);
    run?;

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn async_config(dir: &tempfile::TempDir) -> (Config, CommandLine) {
        let mut options = std::collections::HashMap::new();
        options.insert("stanza".to_string(), "main".to_string());
        options.insert("archive-async".to_string(), "y".to_string());
        options.insert("archive-timeout".to_string(), "500".to_string());
        options.insert(
            "spool-path".to_string(),
            dir.path().join("spool").to_str().unwrap().to_string(),
        );
        options.insert(
            "lock-path".to_string(),
            dir.path().join("lock").to_str().unwrap().to_string(),
        );
        options.insert(
            "pg-path".to_string(),
            dir.path().to_str().unwrap().to_string(),
        );

        let cli = CommandLine {
            command: String::from("archive-get"),
            role: crate::config::CommandRole::Default,
            parameters: vec![
                String::from("000000010000000000000005"),
                dir.path().join("RECOVERYXLOG").to_str().unwrap().to_string(),
            ],
            config_file: Some(String::from("/nonexistent")),
            options,
        };
        (crate::config::load(&cli).unwrap(), cli)
    }

    #[test]
    fn prefetched_segment_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let (config, cli) = async_config(&dir);

        let in_dir = spool_create(&config, "main", SpoolDirection::In).unwrap();
        std::fs::write(in_dir.join("000000010000000000000005"), b"wal bytes").unwrap();

        assert_eq!(cmd_archive_get(&config, &cli).unwrap(), 0);
        assert_eq!(
            std::fs::read(dir.path().join("RECOVERYXLOG")).unwrap(),
            b"wal bytes"
        );
        // Consumed from the queue.
        assert!(!in_dir.join("000000010000000000000005").exists());
    }

    #[test]
    fn recorded_miss_returns_one() {
        let dir = tempfile::tempdir().unwrap();
        let (config, cli) = async_config(&dir);

        let in_dir = spool_create(&config, "main", SpoolDirection::In).unwrap();
        status_write_ok(&in_dir, "000000010000000000000005").unwrap();

        assert_eq!(cmd_archive_get(&config, &cli).unwrap(), 1);
    }

    #[test]
    fn recorded_error_is_raised() {
        let dir = tempfile::tempdir().unwrap();
        let (config, cli) = async_config(&dir);

        let in_dir = spool_create(&config, "main", SpoolDirection::In).unwrap();
        let recorded = vault_err(ErrorClass::Checksum, "archive copy is corrupt");
        status_write_error(&in_dir, "000000010000000000000005", &recorded).unwrap();

        let err = cmd_archive_get(&config, &cli).unwrap_err();
        assert_eq!(crate::error::error_class(&err), ErrorClass::Checksum);
    }
}
