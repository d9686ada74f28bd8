//! Info command: human and JSON views of the repository contents.

use anyhow::Error;
use chrono::{Local, TimeZone};
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::{BackupEntry, BackupInfo};
use crate::storage::{repo_storage, InfoLevel, Storage};
use crate::tools::size_format;

pub fn cmd_info(config: &Config) -> Result<i32, Error> {
    let storage = repo_storage(config)?;

    // One stanza when requested, every stanza in the repository otherwise.
    let stanzas: Vec<String> = match &config.stanza {
        Some(stanza) => vec![stanza.clone()],
        None => storage
            .list("backup", None, InfoLevel::Exists)?
            .into_iter()
            .filter(|entry| entry.file_type == crate::storage::FileType::Path)
            .map(|entry| entry.name)
            .collect(),
    };

    let mut report = Vec::new();
    for stanza in &stanzas {
        report.push(stanza_info(config, &storage, stanza)?);
    }

    match config.output.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&Value::Array(report))?),
        "text" => print_text(&report),
        other => {
            return Err(vault_err(
                ErrorClass::Option,
                format!("invalid output format '{}'", other),
            ))
        }
    }

    Ok(0)
}

fn stanza_info(config: &Config, storage: &Storage, stanza: &str) -> Result<Value, Error> {
    let cipher = config.cipher()?;

    let backup_info = match BackupInfo::load(storage, stanza, cipher.as_ref()) {
        Ok(info) => info,
        Err(err) => {
            return Ok(json!({
                "name": stanza,
                "status": {"code": 1, "message": format!("{}", err)},
                "backup": [],
            }))
        }
    };

    let archive = match ArchiveInfo::load(storage, stanza, cipher.as_ref()) {
        Ok(info) => Some(json!({
            "id": info.archive_id(),
            "db-version": info.current().version,
            "db-system-id": info.current().system_id,
        })),
        Err(_) => None,
    };

    let mut backups = Vec::new();
    for label in backup_info.labels() {
        let entry = backup_info.get(&label).unwrap();
        if let Some(set) = &config.set {
            if *set != label {
                continue;
            }
        }
        backups.push(backup_json(entry));
    }

    Ok(json!({
        "name": stanza,
        "status": {"code": 0, "message": "ok"},
        "archive": archive,
        "backup": backups,
    }))
}

fn backup_json(entry: &BackupEntry) -> Value {
    json!({
        "label": entry.label,
        "type": entry.backup_type.as_str(),
        "prior": entry.prior,
        "reference": entry.reference,
        "timestamp": {"start": entry.timestamp_start, "stop": entry.timestamp_stop},
        "archive": {"start": entry.archive_start, "stop": entry.archive_stop},
        "info": {"size": entry.size, "repo-size": entry.repo_size},
        "database": {"id": entry.db_id},
    })
}

fn time_str(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("-"),
    }
}

fn print_text(report: &[Value]) {
    for stanza in report {
        let name = stanza.get("name").and_then(Value::as_str).unwrap_or("?");
        println!("stanza: {}", name);

        let status = stanza
            .get("status")
            .and_then(|s| s.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("?");
        println!("    status: {}", status);

        if let Some(archive) = stanza.get("archive").filter(|a| !a.is_null()) {
            println!(
                "    wal archive: {} (version {})",
                archive.get("id").and_then(Value::as_str).unwrap_or("?"),
                archive.get("db-version").and_then(Value::as_str).unwrap_or("?"),
            );
        }

        for backup in stanza
            .get("backup")
            .and_then(Value::as_array)
            .map(|b| b.as_slice())
            .unwrap_or(&[])
        {
            let label = backup.get("label").and_then(Value::as_str).unwrap_or("?");
            let backup_type = backup.get("type").and_then(Value::as_str).unwrap_or("?");
            println!("\n    {} backup: {}", backup_type, label);

            if let Some(timestamp) = backup.get("timestamp") {
                println!(
                    "        timestamp start/stop: {} / {}",
                    time_str(timestamp.get("start").and_then(Value::as_i64).unwrap_or(0)),
                    time_str(timestamp.get("stop").and_then(Value::as_i64).unwrap_or(0)),
                );
            }
            if let Some(archive) = backup.get("archive") {
                let start = archive.get("start").and_then(Value::as_str).unwrap_or("n/a");
                let stop = archive.get("stop").and_then(Value::as_str).unwrap_or("n/a");
                println!("        wal start/stop: {} / {}", start, stop);
            }
            if let Some(info) = backup.get("info") {
                println!(
                    "        database size: {}, backup size: {}",
                    size_format(info.get("size").and_then(Value::as_u64).unwrap_or(0)),
                    size_format(info.get("repo-size").and_then(Value::as_u64).unwrap_or(0)),
                );
            }

            let reference: Vec<&str> = backup
                .get("reference")
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !reference.is_empty() {
                println!("        references: {}", reference.join(", "));
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_json_shape() {
        let entry = BackupEntry {
            label: String::from("20250101-000000F"),
            backup_type: crate::info::backup::BackupType::Full,
            timestamp_start: 100,
            timestamp_stop: 200,
            archive_start: Some(String::from("000000010000000000000002")),
            archive_stop: Some(String::from("000000010000000000000002")),
            prior: None,
            reference: Vec::new(),
            size: 1000,
            repo_size: 300,
            db_id: 1,
            compress_type: String::from("gz"),
        };

        let value = backup_json(&entry);
        assert_eq!(value["label"], "20250101-000000F");
        assert_eq!(value["type"], "full");
        assert_eq!(value["info"]["size"], 1000);
        assert_eq!(value["archive"]["start"], "000000010000000000000002");
    }
}
