//! Worker side protocol server.
//!
//! Reads requests from the master, dispatches to registered handlers, and
//! writes one response per request. The loop ends at EOF (master closed the
//! pipes) or on an explicit exit command. Handler errors are serialized into
//! error responses; they never kill the worker.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};

use anyhow::{Context, Error};
use serde_json::Value;

use crate::error::{vault_err, ErrorClass};

use super::{error_line, read_line, response_line, PROTOCOL_CMD_CONFIG, PROTOCOL_CMD_EXIT};

type HandlerFn<C> = Box<dyn Fn(&mut C, &[Value]) -> Result<Value, Error>>;

pub struct ProtocolServer<C> {
    handlers: HashMap<String, HandlerFn<C>>,
}

impl<C> ProtocolServer<C> {
    pub fn new() -> Self {
        ProtocolServer {
            handlers: HashMap::new(),
        }
    }

    pub fn handler(
        mut self,
        cmd: &str,
        handler: impl Fn(&mut C, &[Value]) -> Result<Value, Error> + 'static,
    ) -> Self {
        self.handlers.insert(cmd.to_string(), Box::new(handler));
        self
    }

    /// Serve until EOF or exit.
    pub fn run(
        &self,
        context: &mut C,
        input: impl Read,
        mut output: impl Write,
    ) -> Result<(), Error> {
        let mut reader = BufReader::new(input);

        loop {
            let message = match read_line(&mut reader)? {
                Some(message) => message,
                None => return Ok(()),
            };

            let cmd = message
                .get("cmd")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            if cmd == PROTOCOL_CMD_EXIT {
                return Ok(());
            }

            let empty = Vec::new();
            let parameter = message
                .get("parameter")
                .and_then(Value::as_array)
                .unwrap_or(&empty);

            let line = match self.handlers.get(&cmd) {
                Some(handler) => match handler(context, parameter) {
                    Ok(out) => response_line(&out),
                    Err(err) => error_line(&err),
                },
                None => error_line(&vault_err(
                    ErrorClass::Protocol,
                    format!("unknown protocol command '{}'", cmd),
                )),
            };

            output.write_all(line.as_bytes()).context("protocol response write failed")?;
            output.flush().context("protocol response flush failed")?;
        }
    }
}

impl<C> Default for ProtocolServer<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the one-time configuration prelude the master sends first. Returns
/// the option payload. Reads byte-wise so no buffering steals the first
/// real request from the server loop that follows.
pub fn read_config_prelude(input: &mut impl Read) -> Result<Value, Error> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if input.read(&mut byte)? == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > super::PROTOCOL_LINE_MAX {
            return Err(vault_err(ErrorClass::Protocol, "protocol line too long"));
        }
    }

    if line.is_empty() {
        return Err(vault_err(
            ErrorClass::Protocol,
            "connection closed before configuration",
        ));
    }

    let message: Value = serde_json::from_slice(&line).map_err(|err| {
        vault_err(
            ErrorClass::Protocol,
            format!("invalid configuration message - {}", err),
        )
    })?;

    let cmd = message.get("cmd").and_then(Value::as_str).unwrap_or("");
    if cmd != PROTOCOL_CMD_CONFIG {
        return Err(vault_err(
            ErrorClass::Protocol,
            format!("expected configuration message, got '{}'", cmd),
        ));
    }

    Ok(message
        .get("parameter")
        .and_then(Value::as_array)
        .and_then(|parameter| parameter.first())
        .cloned()
        .unwrap_or(Value::Null))
}
