//! Repository utility commands: ls, get, put, rm.
//!
//! Thin wrappers over the storage facade for operators poking at the
//! repository. `repo-get` and `repo-put` move raw bytes; decoding stored
//! payloads is verify/restore territory.

use std::io::{Read, Write};

use anyhow::Error;
use serde_json::{json, Value};

use crate::config::{CommandLine, Config};
use crate::error::{vault_err, ErrorClass};
use crate::io::FilterGroup;
use crate::storage::{repo_storage, InfoLevel, WriteOptions};

fn parameter(cli: &CommandLine, index: usize, what: &str) -> Result<String, Error> {
    cli.parameters.get(index).cloned().ok_or_else(|| {
        vault_err(
            ErrorClass::Option,
            format!("{} is required by {}", what, cli.command),
        )
    })
}

pub fn cmd_repo_ls(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    let path = cli.parameters.first().cloned().unwrap_or_default();
    let storage = repo_storage(config)?;
    let list = storage.list(&path, None, InfoLevel::Basic)?;

    match config.output.as_str() {
        "json" => {
            let rows: Vec<Value> = list
                .iter()
                .map(|entry| {
                    json!({
                        "name": entry.name,
                        "type": entry.file_type.as_str(),
                        "size": entry.size,
                        "mtime": entry.modification_time,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&Value::Array(rows))?);
        }
        _ => {
            for entry in list {
                println!("{}", entry.name);
            }
        }
    }

    Ok(0)
}

pub fn cmd_repo_get(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    let path = parameter(cli, 0, "repository file path")?;
    let storage = repo_storage(config)?;

    let mut read = match storage.new_read(&path, true, FilterGroup::new())? {
        Some(read) => read,
        None => return Ok(1),
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut chunk = vec![0u8; crate::io::IO_BUFFER_SIZE];
    loop {
        let count = read.read(&mut chunk)?;
        if count == 0 {
            break;
        }
        out.write_all(&chunk[..count])?;
    }
    out.flush()?;

    Ok(0)
}

pub fn cmd_repo_put(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    let path = parameter(cli, 0, "repository file path")?;
    let storage = repo_storage(config)?;

    let mut data = Vec::new();
    std::io::stdin().lock().read_to_end(&mut data)?;

    let mut write = storage.new_write(&path, &WriteOptions::default(), FilterGroup::new())?;
    write.write(&data)?;
    write.close()?;

    Ok(0)
}

pub fn cmd_repo_rm(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    let path = parameter(cli, 0, "repository path")?;
    let storage = repo_storage(config)?;

    let recurse = cli
        .options
        .get("recurse")
        .map(|value| value == "y" || value == "true")
        .unwrap_or(false);

    match storage.info(&path, InfoLevel::Exists)? {
        Some(info) if info.file_type == crate::storage::FileType::Path => {
            if !recurse {
                return Err(vault_err(
                    ErrorClass::Option,
                    format!("'{}' is a path - use --recurse to remove it", path),
                ));
            }
            storage.path_remove(&path, true)?;
        }
        Some(_) => storage.remove(&path, true)?,
        None => storage.remove(&path, false)?,
    }

    Ok(0)
}
