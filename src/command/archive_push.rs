//! Archive-push command.
//!
//! PostgreSQL's archive_command runs this synchronously, one segment at a
//! time. In direct mode the segment is pushed inline. In async mode the
//! synchronous invocation only consults the spool status, queues the
//! segment, and forks the daemon; the daemon batches the queue and pushes
//! through the parallel worker pool, marking each segment `ok` or `error`.

use std::time::{Duration, Instant};

use anyhow::Error;
use log::{info, warn};
use serde_json::json;

use crate::archive::push::{push_file, PushResult};
use crate::archive::spool::{
    global_error_clear, global_error_read, global_error_write, queue_list, spool_create,
    status_clear, status_raise, status_read, status_write_error, status_write_ok, SpoolDirection,
};
use crate::config::{CommandLine, Config};
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::lock::{acquire, stop_check, LockType};
use crate::protocol::parallel::{ExecutorJob, ParallelExecutor};
use crate::protocol::spawn;
use crate::storage::repo_storage;

use super::local::{wal_source_path, CMD_ARCHIVE_PUSH_FILE};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn wal_file_name(wal_path: &str) -> Result<&str, Error> {
    wal_path.rsplit('/').next().filter(|name| !name.is_empty()).ok_or_else(|| {
        vault_err(
            ErrorClass::Option,
            format!("invalid WAL path '{}'", wal_path),
        )
    })
}

pub fn cmd_archive_push(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    let stanza = config.stanza()?;
    stop_check(&config.lock_path, Some(stanza))?;

    let wal_path = cli.parameters.first().ok_or_else(|| {
        vault_err(
            ErrorClass::Option,
            "WAL segment path is required by archive-push",
        )
    })?;
    let source = wal_source_path(config, wal_path)?;
    let file_name = wal_file_name(wal_path)?;

    if !config.archive_async {
        let storage = repo_storage(config)?;
        let cipher = config.cipher()?;
        let archive_info = ArchiveInfo::load(&storage, stanza, cipher.as_ref())?;

        let result = push_file(config, &storage, &archive_info, &source, file_name)?;
        log_pushed(&result);
        return Ok(0);
    }

    // Async mode: trust only the status files.
    let out_dir = spool_create(config, stanza, SpoolDirection::Out)?;

    if let Some(status) = status_read(&out_dir, file_name)? {
        // A prior daemon already decided this segment.
        status_clear(&out_dir, file_name)?;
        status_raise(&status)?;
        info!("pushed WAL file '{}' to the archive asynchronously", file_name);
        return Ok(0);
    }

    // Queue the segment for the daemon, then fork it and wait.
    let queued = out_dir.join(file_name);
    if !queued.exists() {
        std::fs::copy(&source, &queued).map_err(|err| {
            vault_err(
                ErrorClass::FileWrite,
                format!("unable to queue WAL file '{}' - {}", source.display(), err),
            )
        })?;
    }

    spawn::spawn_async(cli, "archive-push")?;

    let deadline = Instant::now() + config.archive_timeout;
    loop {
        if let Some(status) = status_read(&out_dir, file_name)? {
            status_clear(&out_dir, file_name)?;
            status_raise(&status)?;
            log_pushed_name(file_name);
            return Ok(0);
        }

        // A daemon that died before dispatching records a global error.
        if let Some(status) = global_error_read(&out_dir) {
            global_error_clear(&out_dir);
            status_raise(&status)?;
        }

        if Instant::now() >= deadline {
            return Err(vault_err(
                ErrorClass::ArchiveTimeout,
                format!(
                    "unable to push WAL file '{}' within {}ms\n\
                     HINT: check the async daemon log and the spool error files",
                    file_name,
                    config.archive_timeout.as_millis()
                ),
            ));
        }

        std::thread::sleep(STATUS_POLL_INTERVAL);
    }
}

fn log_pushed(result: &PushResult) {
    if result.dedup {
        warn!(
            "WAL file '{}' already exists in the archive with the same checksum - skipped",
            result.file
        );
    } else {
        log_pushed_name(&result.file);
    }
}

fn log_pushed_name(file: &str) {
    info!("pushed WAL file '{}' to the archive", file);
}

/// Async daemon: drain the spool queue through the worker pool.
pub fn cmd_archive_push_async(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza()?;

    // A concurrent daemon already owns the queue; that is not an error.
    let _lock = match acquire(&config.lock_path, stanza, LockType::Archive) {
        Ok(lock) => lock,
        Err(_) => return Ok(0),
    };

    let out_dir = spool_create(config, stanza, SpoolDirection::Out)?;
    global_error_clear(&out_dir);

    let queue = queue_list(&out_dir)?;
    if queue.is_empty() {
        return Ok(0);
    }
    info!("pushing {} queued WAL files", queue.len());

    let prepared = match spawn::spawn_pool(config, "archive-push", config.process_max) {
        Ok(workers) => workers,
        Err(err) => {
            // Nothing was dispatched yet: record the failure globally so
            // the synchronous side does not wait out its full timeout.
            global_error_write(&out_dir, &err);
            return Err(err);
        }
    };
    let (clients, children) = spawn::into_clients(prepared);

    let mut jobs: Vec<ExecutorJob> = queue
        .iter()
        .map(|segment| {
            ExecutorJob::new(
                segment.clone(),
                CMD_ARCHIVE_PUSH_FILE,
                vec![
                    json!(out_dir.join(segment).to_str()),
                    json!(segment),
                ],
            )
            .retry(2, Duration::from_secs(1))
        })
        .collect();
    jobs.reverse();

    let mut executor =
        ParallelExecutor::new(clients, config.protocol_timeout, move || jobs.pop());

    let run = executor.run(|result| {
        match result.out {
            Ok(_) => {
                status_write_ok(&out_dir, &result.key)?;
                let _ = std::fs::remove_file(out_dir.join(&result.key));
                info!(
                    "pushed WAL file '{}' (worker {}, retries {})",
                    result.key, result.pid, result.retries_used
                );
            }
            Err(err) => {
                warn!("unable to push WAL file '{}' - {:#}", result.key, err);
                status_write_error(&out_dir, &result.key, &err)?;
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
