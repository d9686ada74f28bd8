//! Master/worker protocol.
//!
//! A master process talks to each worker over a pair of pipes carrying line
//! delimited JSON. Requests are `{"cmd": name, "parameter": [...]}`;
//! responses are `{"out": value}` on success or
//! `{"err": code, "out": message, "errStack": trace}` on failure, in which
//! case the master re-raises an equivalent error with the worker's stack
//! appended. Requests and responses are strictly FIFO per worker.
//!
//! Workers receive a one-time `config` message before anything else so a
//! spawned process needs no command line options beyond its role.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::io::RawFd;

use anyhow::{Context, Error};
use serde_json::{json, Value};

use crate::error::{error_class, vault_err, ErrorClass, VaultError};

pub mod parallel;
pub mod server;
pub mod spawn;

/// Upper bound for one protocol line; a worker that exceeds it is broken.
pub const PROTOCOL_LINE_MAX: usize = 64 * 1024 * 1024;

pub const PROTOCOL_CMD_CONFIG: &str = "config";
pub const PROTOCOL_CMD_EXIT: &str = "exit";

/// Encode a request line.
pub fn request_line(cmd: &str, parameter: &[Value]) -> String {
    let mut line = json!({"cmd": cmd, "parameter": parameter}).to_string();
    line.push('\n');
    line
}

/// Encode a success response line.
pub fn response_line(out: &Value) -> String {
    let mut line = json!({ "out": out }).to_string();
    line.push('\n');
    line
}

/// Encode an error response line from a caught error.
pub fn error_line(err: &Error) -> String {
    let class = error_class(err);
    let stack = format!("{:#}", err);
    let mut line = json!({
        "err": class.code(),
        "out": err.to_string(),
        "errStack": stack,
    })
    .to_string();
    line.push('\n');
    line
}

/// Read one protocol line from a buffered reader. Ok(None) at EOF.
pub fn read_line(reader: &mut impl BufRead) -> Result<Option<Value>, Error> {
    let mut line = String::new();
    let count = reader
        .read_line(&mut line)
        .context("protocol read failed")?;

    if count == 0 {
        return Ok(None);
    }
    if line.len() > PROTOCOL_LINE_MAX {
        return Err(vault_err(ErrorClass::Protocol, "protocol line too long"));
    }

    let value: Value = serde_json::from_str(line.trim_end())
        .map_err(|err| vault_err(ErrorClass::Protocol, format!("invalid protocol message - {}", err)))?;
    Ok(Some(value))
}

/// Turn a response value into the command output, re-raising worker errors.
pub fn response_out(response: Value) -> Result<Value, Error> {
    if let Some(code) = response.get("err").and_then(Value::as_i64) {
        let message = response
            .get("out")
            .and_then(Value::as_str)
            .unwrap_or("unknown worker error")
            .to_string();
        let stack = response
            .get("errStack")
            .and_then(Value::as_str)
            .map(String::from);

        return Err(VaultError::remote(code as i32, message, stack).into());
    }

    Ok(response.get("out").cloned().unwrap_or(Value::Null))
}

/// Client end of a protocol connection.
pub struct ProtocolClient {
    writer: Box<dyn Write>,
    reader: BufReader<Box<dyn Read>>,
    /// Read side descriptor, polled by the parallel executor.
    fd: RawFd,
    pid: i32,
}

impl ProtocolClient {
    pub fn new(writer: Box<dyn Write>, reader: Box<dyn Read>, fd: RawFd, pid: i32) -> Self {
        ProtocolClient {
            writer,
            reader: BufReader::new(reader),
            fd,
            pid,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Send a request without waiting for the response.
    pub fn send(&mut self, cmd: &str, parameter: &[Value]) -> Result<(), Error> {
        self.writer
            .write_all(request_line(cmd, parameter).as_bytes())
            .context("protocol write failed")?;
        self.writer.flush().context("protocol flush failed")?;
        Ok(())
    }

    /// Read the next response, re-raising worker errors locally.
    pub fn receive(&mut self) -> Result<Value, Error> {
        match read_line(&mut self.reader)? {
            Some(response) => response_out(response),
            None => Err(vault_err(
                ErrorClass::Protocol,
                format!("worker {} closed the connection unexpectedly", self.pid),
            )),
        }
    }

    /// Round trip: send a request and wait for its response.
    pub fn execute(&mut self, cmd: &str, parameter: &[Value]) -> Result<Value, Error> {
        self.send(cmd, parameter)?;
        self.receive()
    }

    /// Ask the worker to exit; it terminates when its read side drains.
    pub fn exit(&mut self) {
        let _ = self.send(PROTOCOL_CMD_EXIT, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encoding() {
        let line = request_line("archive-push-file", &[json!("0000000100000001000000AB")]);
        assert_eq!(
            line,
            "{\"cmd\":\"archive-push-file\",\"parameter\":[\"0000000100000001000000AB\"]}\n"
        );
    }

    #[test]
    fn success_response_round_trip() {
        let mut reader = std::io::Cursor::new(response_line(&json!({"size": 42})));
        let value = read_line(&mut reader).unwrap().unwrap();
        assert_eq!(response_out(value).unwrap(), json!({"size": 42}));
    }

    #[test]
    fn error_response_reraises() {
        let err = vault_err(ErrorClass::FileMissing, "segment not found");
        let mut reader = std::io::Cursor::new(error_line(&err));
        let value = read_line(&mut reader).unwrap().unwrap();

        let raised = response_out(value).unwrap_err();
        assert_eq!(error_class(&raised), ErrorClass::FileMissing);
        assert_eq!(raised.to_string(), "segment not found");
    }

    #[test]
    fn eof_is_none() {
        let mut reader = std::io::Cursor::new(Vec::new());
        assert!(read_line(&mut reader).unwrap().is_none());
    }

    #[test]
    fn client_round_trip_over_buffers() {
        // Pre-canned worker responses on the read side.
        let responses = format!(
            "{}{}",
            response_line(&json!("ok-1")),
            response_line(&json!("ok-2"))
        );

        let mut client = ProtocolClient::new(
            Box::new(Vec::new()),
            Box::new(std::io::Cursor::new(responses.into_bytes())),
            -1,
            0,
        );

        assert_eq!(client.execute("noop", &[]).unwrap(), json!("ok-1"));
        assert_eq!(client.execute("noop", &[]).unwrap(), json!("ok-2"));
    }
}
