//! Remote storage driver.
//!
//! Forwards every object operation over the protocol to a `:remote` server
//! running the same binary on the repository host, which executes them with
//! its local posix driver. File payloads travel base64 encoded inside the
//! JSON frames.

use std::cell::RefCell;
use std::io::{Cursor, Read};
use std::rc::Rc;

use anyhow::Error;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::{vault_err, ErrorClass};
use crate::io::RawWrite;
use crate::protocol::ProtocolClient;
use crate::storage::{
    FileType, InfoLevel, StorageDriver, StorageFeature, StorageInfo, WriteOptions,
};

pub const CMD_STORAGE_FEATURES: &str = "storage-features";
pub const CMD_STORAGE_INFO: &str = "storage-info";
pub const CMD_STORAGE_LIST: &str = "storage-list";
pub const CMD_STORAGE_READ: &str = "storage-read";
pub const CMD_STORAGE_WRITE: &str = "storage-write";
pub const CMD_STORAGE_PATH_CREATE: &str = "storage-path-create";
pub const CMD_STORAGE_PATH_REMOVE: &str = "storage-path-remove";
pub const CMD_STORAGE_REMOVE: &str = "storage-remove";
pub const CMD_STORAGE_MOVE: &str = "storage-move";

fn level_str(level: InfoLevel) -> &'static str {
    match level {
        InfoLevel::Exists => "exists",
        InfoLevel::Basic => "basic",
        InfoLevel::Detail => "detail",
    }
}

pub fn level_parse(value: &str) -> InfoLevel {
    match value {
        "detail" => InfoLevel::Detail,
        "basic" => InfoLevel::Basic,
        _ => InfoLevel::Exists,
    }
}

/// Serialize an info record for the wire.
pub fn info_to_value(info: &StorageInfo) -> Value {
    json!({
        "name": info.name,
        "type": info.file_type.as_str(),
        "size": info.size,
        "mode": info.mode,
        "user": info.user,
        "group": info.group,
        "mtime": info.modification_time,
        "destination": info.link_target,
    })
}

fn info_from_value(value: &Value) -> Result<StorageInfo, Error> {
    let file_type = match value.get("type").and_then(Value::as_str) {
        Some("file") => FileType::File,
        Some("path") => FileType::Path,
        Some("link") => FileType::Link,
        Some("special") => FileType::Special,
        other => {
            return Err(vault_err(
                ErrorClass::Protocol,
                format!("invalid remote file type {:?}", other),
            ))
        }
    };

    Ok(StorageInfo {
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        file_type,
        size: value.get("size").and_then(Value::as_u64).unwrap_or(0),
        mode: value.get("mode").and_then(Value::as_u64).map(|m| m as u32),
        user: value.get("user").and_then(Value::as_str).map(String::from),
        group: value.get("group").and_then(Value::as_str).map(String::from),
        modification_time: value.get("mtime").and_then(Value::as_i64),
        link_target: value
            .get("destination")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

pub struct RemoteDriver {
    client: Rc<RefCell<ProtocolClient>>,
    features: StorageFeature,
}

impl RemoteDriver {
    /// Wrap an established protocol connection; queries the remote feature
    /// set once.
    pub fn new(client: ProtocolClient) -> Result<Self, Error> {
        let client = Rc::new(RefCell::new(client));
        let features = {
            let bits = client
                .borrow_mut()
                .execute(CMD_STORAGE_FEATURES, &[])?
                .as_u64()
                .unwrap_or(0);
            StorageFeature::from_bits_truncate(bits as u32)
        };

        Ok(RemoteDriver { client, features })
    }

    fn execute(&self, cmd: &str, parameter: &[Value]) -> Result<Value, Error> {
        self.client.borrow_mut().execute(cmd, parameter)
    }
}

impl StorageDriver for RemoteDriver {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn features(&self) -> StorageFeature {
        // Hardlinks cannot cross the protocol boundary.
        self.features & !StorageFeature::HARDLINK
    }

    fn info(&self, path: &str, level: InfoLevel) -> Result<Option<StorageInfo>, Error> {
        let out = self.execute(CMD_STORAGE_INFO, &[json!(path), json!(level_str(level))])?;
        match out {
            Value::Null => Ok(None),
            value => Ok(Some(info_from_value(&value)?)),
        }
    }

    fn list(
        &self,
        path: &str,
        expression: Option<&Regex>,
        level: InfoLevel,
    ) -> Result<Vec<StorageInfo>, Error> {
        let out = self.execute(CMD_STORAGE_LIST, &[json!(path), json!(level_str(level))])?;

        let mut result = Vec::new();
        for value in out.as_array().cloned().unwrap_or_default() {
            let info = info_from_value(&value)?;
            if let Some(expression) = expression {
                if !expression.is_match(&info.name) {
                    continue;
                }
            }
            result.push(info);
        }

        Ok(result)
    }

    fn new_read(
        &self,
        path: &str,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Option<Box<dyn Read>>, Error> {
        let out = self.execute(
            CMD_STORAGE_READ,
            &[json!(path), json!(offset), json!(limit)],
        )?;

        match out {
            Value::Null => Ok(None),
            value => {
                let encoded = value
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| vault_err(ErrorClass::Protocol, "remote read missing data"))?;
                let data = base64::decode(encoded)
                    .map_err(|err| vault_err(ErrorClass::Protocol, format!("invalid remote data - {}", err)))?;
                Ok(Some(Box::new(Cursor::new(data))))
            }
        }
    }

    fn new_write(&self, path: &str, options: &WriteOptions) -> Result<Box<dyn RawWrite>, Error> {
        Ok(Box::new(RemoteWrite {
            client: self.client.clone(),
            path: path.to_string(),
            options: options.clone(),
            staged: Some(Vec::new()),
        }))
    }

    fn path_create(
        &self,
        path: &str,
        mode: Option<u32>,
        error_on_exists: bool,
        recurse: bool,
    ) -> Result<(), Error> {
        self.execute(
            CMD_STORAGE_PATH_CREATE,
            &[json!(path), json!(mode), json!(error_on_exists), json!(recurse)],
        )?;
        Ok(())
    }

    fn path_remove(&self, path: &str, recurse: bool) -> Result<(), Error> {
        self.execute(CMD_STORAGE_PATH_REMOVE, &[json!(path), json!(recurse)])?;
        Ok(())
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), Error> {
        self.execute(CMD_STORAGE_REMOVE, &[json!(path), json!(error_on_missing)])?;
        Ok(())
    }

    fn move_file(&self, from: &str, to: &str) -> Result<(), Error> {
        self.execute(CMD_STORAGE_MOVE, &[json!(from), json!(to)])?;
        Ok(())
    }
}

struct RemoteWrite {
    client: Rc<RefCell<ProtocolClient>>,
    path: String,
    options: WriteOptions,
    staged: Option<Vec<u8>>,
}

impl RawWrite for RemoteWrite {
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.staged.as_mut() {
            Some(staged) => {
                staged.extend_from_slice(data);
                Ok(())
            }
            None => Err(vault_err(ErrorClass::Assert, "remote write already closed")),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| vault_err(ErrorClass::Assert, "remote write already closed"))?;

        self.client.borrow_mut().execute(
            CMD_STORAGE_WRITE,
            &[
                json!(self.path),
                json!(base64::encode(&staged)),
                json!(self.options.atomic),
                json!(self.options.mode),
                json!(self.options.modification_time),
            ],
        )?;
        Ok(())
    }
}
