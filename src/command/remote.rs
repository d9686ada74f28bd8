//! Remote storage server (`:remote` role).
//!
//! Runs on the repository host and executes storage operations against the
//! local posix driver on behalf of the master. Paths arrive already
//! resolved, so the driver is used directly without the facade.

use anyhow::Error;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{vault_err, ErrorClass};
use crate::io::{FilterGroup, FilteredRead, FilteredWrite};
use crate::protocol::server::ProtocolServer;
use crate::storage::posix::PosixDriver;
use crate::storage::remote::{
    info_to_value, level_parse, CMD_STORAGE_FEATURES, CMD_STORAGE_INFO, CMD_STORAGE_LIST,
    CMD_STORAGE_MOVE, CMD_STORAGE_PATH_CREATE, CMD_STORAGE_PATH_REMOVE, CMD_STORAGE_READ,
    CMD_STORAGE_REMOVE, CMD_STORAGE_WRITE,
};
use crate::storage::{StorageDriver, WriteOptions};

struct RemoteContext {
    driver: PosixDriver,
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

fn param_bool(parameter: &[Value], index: usize) -> bool {
    parameter.get(index).and_then(Value::as_bool).unwrap_or(false)
}

pub fn cmd_remote(_config: &Config) -> Result<i32, Error> {
    let server = ProtocolServer::new()
        .handler(CMD_STORAGE_FEATURES, |context: &mut RemoteContext, _| {
            Ok(json!(context.driver.features().bits()))
        })
        .handler(CMD_STORAGE_INFO, |context, parameter| {
            let path = param_str(parameter, 0)?;
            let level = level_parse(parameter.get(1).and_then(Value::as_str).unwrap_or("basic"));
            Ok(match context.driver.info(&path, level)? {
                Some(info) => info_to_value(&info),
                None => Value::Null,
            })
        })
        .handler(CMD_STORAGE_LIST, |context, parameter| {
            let path = param_str(parameter, 0)?;
            let level = level_parse(parameter.get(1).and_then(Value::as_str).unwrap_or("basic"));
            let list = context.driver.list(&path, None, level)?;
            Ok(Value::Array(list.iter().map(info_to_value).collect()))
        })
        .handler(CMD_STORAGE_READ, |context, parameter| {
            let path = param_str(parameter, 0)?;
            let offset = parameter.get(1).and_then(Value::as_u64);
            let limit = parameter.get(2).and_then(Value::as_u64);

            match context.driver.new_read(&path, offset, limit)? {
                Some(source) => {
                    let mut read = FilteredRead::new(source, FilterGroup::new());
                    let data = read.read_all()?;
                    Ok(json!({ "data": base64::encode(&data) }))
                }
                None => Ok(Value::Null),
            }
        })
        .handler(CMD_STORAGE_WRITE, |context, parameter| {
            let path = param_str(parameter, 0)?;
            let data = base64::decode(param_str(parameter, 1)?).map_err(|err| {
                vault_err(ErrorClass::Protocol, format!("invalid write data - {}", err))
            })?;

            let options = WriteOptions {
                atomic: parameter.get(2).and_then(Value::as_bool).unwrap_or(true),
                create_path: true,
                mode: parameter.get(3).and_then(Value::as_u64).map(|m| m as u32),
                user: None,
                group: None,
                modification_time: parameter.get(4).and_then(Value::as_i64),
            };

            let sink = context.driver.new_write(&path, &options)?;
            let mut write = FilteredWrite::new(sink, FilterGroup::new());
            write.write(&data)?;
            write.close()?;
            Ok(Value::Null)
        })
        .handler(CMD_STORAGE_PATH_CREATE, |context, parameter| {
            let path = param_str(parameter, 0)?;
            let mode = parameter.get(1).and_then(Value::as_u64).map(|m| m as u32);
            context.driver.path_create(
                &path,
                mode,
                param_bool(parameter, 2),
                param_bool(parameter, 3),
            )?;
            Ok(Value::Null)
        })
        .handler(CMD_STORAGE_PATH_REMOVE, |context, parameter| {
            let path = param_str(parameter, 0)?;
            context.driver.path_remove(&path, param_bool(parameter, 1))?;
            Ok(Value::Null)
        })
        .handler(CMD_STORAGE_REMOVE, |context, parameter| {
            let path = param_str(parameter, 0)?;
            context.driver.remove(&path, param_bool(parameter, 1))?;
            Ok(Value::Null)
        })
        .handler(CMD_STORAGE_MOVE, |context, parameter| {
            let from = param_str(parameter, 0)?;
            let to = param_str(parameter, 1)?;
            context.driver.move_file(&from, &to)?;
            Ok(Value::Null)
        });

    let mut context = RemoteContext {
        driver: PosixDriver::new(true),
    };
    server.run(&mut context, std::io::stdin().lock(), std::io::stdout().lock())?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{request_line, response_out};

    // Drive the server loop over in-memory pipes and decode each response.
    fn serve(requests: &str) -> Vec<Value> {
        let server = ProtocolServer::new()
            .handler(CMD_STORAGE_FEATURES, |context: &mut RemoteContext, _| {
                Ok(json!(context.driver.features().bits()))
            })
            .handler(CMD_STORAGE_INFO, |context, parameter| {
                let path = param_str(parameter, 0)?;
                Ok(match context
                    .driver
                    .info(&path, level_parse("basic"))
                    .unwrap()
                {
                    Some(info) => info_to_value(&info),
                    None => Value::Null,
                })
            });

        let mut context = RemoteContext {
            driver: PosixDriver::new(false),
        };
        let mut output = Vec::new();
        server
            .run(&mut context, requests.as_bytes(), &mut output)
            .unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn features_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("present");
        std::fs::write(&file, b"x").unwrap();

        let requests = format!(
            "{}{}{}",
            request_line(CMD_STORAGE_FEATURES, &[]),
            request_line(CMD_STORAGE_INFO, &[json!(file.to_str().unwrap())]),
            request_line(CMD_STORAGE_INFO, &[json!("/no/such/file")]),
        );

        let responses = serve(&requests);
        assert!(response_out(responses[0].clone()).unwrap().as_u64().unwrap() > 0);

        let info = response_out(responses[1].clone()).unwrap();
        assert_eq!(info.get("type").unwrap(), "file");
        assert_eq!(info.get("size").unwrap(), 1);

        assert_eq!(response_out(responses[2].clone()).unwrap(), Value::Null);
    }
}
