//! Local worker server (`:local` role).
//!
//! Executes unit jobs dispatched by the parallel executor: single file
//! pushes, fetches, backup copies, and verifies. Results travel back as
//! base64 encoded packs.

use std::path::{Path, PathBuf};

use anyhow::Error;
use serde_json::{json, Value};

use crate::archive::{get::get_file, push::push_file};
use crate::config::Config;
use crate::crypt::CipherConfig;
use crate::error::{vault_err, ErrorClass};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::BackupInfo;
use crate::protocol::server::ProtocolServer;
use crate::storage::{repo_storage, Storage};

use super::backup::{backup_file, relation_first_block, CMD_BACKUP_FILE};
use super::verify::{verify_file, CMD_VERIFY_FILE};

pub const CMD_ARCHIVE_PUSH_FILE: &str = "archive-push-file";
pub const CMD_ARCHIVE_GET_FILE: &str = "archive-get-file";

struct LocalContext {
    config: Config,
    storage: Option<Storage>,
    archive_info: Option<ArchiveInfo>,
    backup_subkey: Option<Option<CipherConfig>>,
}

impl LocalContext {
    fn storage(&mut self) -> Result<&Storage, Error> {
        if self.storage.is_none() {
            self.storage = Some(repo_storage(&self.config)?);
        }
        Ok(self.storage.as_ref().unwrap())
    }

    fn archive_info(&mut self) -> Result<ArchiveInfo, Error> {
        if self.archive_info.is_none() {
            let cipher = self.config.cipher()?;
            self.storage()?;
            self.archive_info = Some(ArchiveInfo::load(
                self.storage.as_ref().unwrap(),
                self.config.stanza()?,
                cipher.as_ref(),
            )?);
        }
        Ok(self.archive_info.clone().unwrap())
    }

    // Subkey for backup payloads, loaded from the registry once.
    fn backup_subkey(&mut self) -> Result<Option<CipherConfig>, Error> {
        if self.backup_subkey.is_none() {
            let cipher = self.config.cipher()?;
            self.storage()?;
            let info = BackupInfo::load(
                self.storage.as_ref().unwrap(),
                self.config.stanza()?,
                cipher.as_ref(),
            )?;
            self.backup_subkey = Some(match info.cipher_pass {
                Some(pass) => Some(CipherConfig::new(&pass)?),
                None => None,
            });
        }
        Ok(self.backup_subkey.clone().unwrap())
    }
}

fn param_str(parameter: &[Value], index: usize) -> Result<String, Error> {
    parameter
        .get(index)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            vault_err(
                ErrorClass::Protocol,
                format!("missing string parameter {}", index),
            )
        })
}

pub fn cmd_local(config: &Config) -> Result<i32, Error> {
    let server = ProtocolServer::new()
        .handler(CMD_ARCHIVE_PUSH_FILE, |context: &mut LocalContext, parameter| {
            let source = PathBuf::from(param_str(parameter, 0)?);
            let file_name = param_str(parameter, 1)?;

            let archive_info = context.archive_info()?;
            let config = context.config.clone();
            let result = push_file(
                &config,
                context.storage()?,
                &archive_info,
                &source,
                &file_name,
            )?;
            Ok(json!(base64::encode(result.to_pack()?)))
        })
        .handler(CMD_ARCHIVE_GET_FILE, |context, parameter| {
            let file_name = param_str(parameter, 0)?;
            let dest = PathBuf::from(param_str(parameter, 1)?);

            let archive_info = context.archive_info()?;
            let config = context.config.clone();
            let result = get_file(
                &config,
                context.storage()?,
                &archive_info,
                &file_name,
                &dest,
            )?;
            Ok(json!(base64::encode(result.to_pack()?)))
        })
        .handler(CMD_BACKUP_FILE, |context, parameter| {
            let source = PathBuf::from(param_str(parameter, 0)?);
            let repo_path = param_str(parameter, 1)?;
            let name = param_str(parameter, 2)?;
            let first_block = parameter.get(3).and_then(Value::as_u64);

            let subkey = context.backup_subkey()?;
            let compress = context.config.compress()?;
            let level = context.config.compress_level;
            let result = backup_file(
                &source,
                context.storage()?,
                &repo_path,
                &name,
                compress,
                level,
                subkey.as_ref(),
                first_block.is_some() || relation_first_block(&name).is_some(),
                first_block.unwrap_or(0),
            )?;
            Ok(json!(base64::encode(result.to_pack()?)))
        })
        .handler(CMD_VERIFY_FILE, |context, parameter| {
            let repo_path = param_str(parameter, 0)?;
            let expected = param_str(parameter, 1)?;
            let cipher_pass = parameter.get(2).and_then(Value::as_str);

            let subkey = match cipher_pass {
                Some(pass) => Some(CipherConfig::new(pass)?),
                None => None,
            };
            let result = verify_file(context.storage()?, &repo_path, &expected, subkey.as_ref())?;
            Ok(json!(base64::encode(result.to_pack()?)))
        });

    let mut context = LocalContext {
        config: config.clone(),
        storage: None,
        archive_info: None,
        backup_subkey: None,
    };
    server.run(&mut context, std::io::stdin().lock(), std::io::stdout().lock())?;
    Ok(0)
}

/// Resolve a WAL path given by PostgreSQL: absolute paths pass through,
/// relative ones anchor at the cluster data directory.
pub fn wal_source_path(config: &Config, wal_path: &str) -> Result<PathBuf, Error> {
    let path = Path::new(wal_path);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let pg_path = config.pg_path.as_deref().ok_or_else(|| {
        vault_err(
            ErrorClass::Option,
            "option 'pg-path' is required with a relative WAL path",
        )
    })?;
    Ok(PathBuf::from(pg_path).join(path))
}
