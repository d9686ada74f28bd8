//! Error classes with stable exit codes.
//!
//! Every command runs inside an error scope that ends up here: local errors
//! carry a class picked at the raise site, remote errors arrive over the
//! protocol as a numeric code plus the worker's stack text and are re-raised
//! with an equivalent class. The process exit code is the class code, so the
//! numeric values are a stable contract with callers and scripts.

use std::fmt;

use anyhow::Error;

/// Stable error classes. Codes 25-255 are reserved for errors; 0 is success
/// and 1 is reserved for command-defined non-fatal results (e.g. archive-get
/// reporting a segment as not found).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Assert,
    Checksum,
    Config,
    Option,
    FileMissing,
    FileOpen,
    FileRead,
    FileWrite,
    PathMissing,
    LockAcquire,
    Crypto,
    ArchiveDuplicate,
    ArchiveTimeout,
    BackupMismatch,
    Repo,
    Stop,
    Format,
    CommandInvalid,
    HostConnect,
    TermSignal,
    Protocol,
    Unknown,
}

impl ErrorClass {
    pub fn code(self) -> i32 {
        match self {
            ErrorClass::Assert => 25,
            ErrorClass::Checksum => 26,
            ErrorClass::Config => 30,
            ErrorClass::Option => 31,
            ErrorClass::FileMissing => 38,
            ErrorClass::FileOpen => 39,
            ErrorClass::FileRead => 40,
            ErrorClass::FileWrite => 41,
            ErrorClass::LockAcquire => 42,
            ErrorClass::Crypto => 43,
            ErrorClass::ArchiveDuplicate => 45,
            ErrorClass::ArchiveTimeout => 46,
            ErrorClass::BackupMismatch => 51,
            ErrorClass::PathMissing => 53,
            ErrorClass::Repo => 54,
            ErrorClass::Format => 55,
            ErrorClass::CommandInvalid => 56,
            ErrorClass::HostConnect => 57,
            ErrorClass::Stop => 62,
            ErrorClass::TermSignal => 63,
            ErrorClass::Protocol => 65,
            ErrorClass::Unknown => 99,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            25 => ErrorClass::Assert,
            26 => ErrorClass::Checksum,
            30 => ErrorClass::Config,
            31 => ErrorClass::Option,
            38 => ErrorClass::FileMissing,
            39 => ErrorClass::FileOpen,
            40 => ErrorClass::FileRead,
            41 => ErrorClass::FileWrite,
            42 => ErrorClass::LockAcquire,
            43 => ErrorClass::Crypto,
            45 => ErrorClass::ArchiveDuplicate,
            46 => ErrorClass::ArchiveTimeout,
            51 => ErrorClass::BackupMismatch,
            53 => ErrorClass::PathMissing,
            54 => ErrorClass::Repo,
            55 => ErrorClass::Format,
            56 => ErrorClass::CommandInvalid,
            57 => ErrorClass::HostConnect,
            62 => ErrorClass::Stop,
            63 => ErrorClass::TermSignal,
            65 => ErrorClass::Protocol,
            _ => ErrorClass::Unknown,
        }
    }

    /// User-reported classes get a short message without a stack trace.
    pub fn user_reported(self) -> bool {
        matches!(
            self,
            ErrorClass::Option
                | ErrorClass::Config
                | ErrorClass::LockAcquire
                | ErrorClass::Stop
                | ErrorClass::CommandInvalid
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}Error", self)
    }
}

/// A classified engine error. Wrapped in `anyhow::Error` for propagation;
/// the entry point downcasts to recover the exit code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct VaultError {
    pub class: ErrorClass,
    pub message: String,
    /// Stack text from a remote worker, appended when re-raising locally.
    pub remote_stack: Option<String>,
}

impl VaultError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        VaultError {
            class,
            message: message.into(),
            remote_stack: None,
        }
    }

    pub fn remote(code: i32, message: impl Into<String>, stack: Option<String>) -> Self {
        VaultError {
            class: ErrorClass::from_code(code),
            message: message.into(),
            remote_stack: stack,
        }
    }
}

/// Shorthand constructor returning `anyhow::Error` directly.
pub fn vault_err(class: ErrorClass, message: impl Into<String>) -> Error {
    VaultError::new(class, message).into()
}

/// Map any propagated error to its exit code. Errors raised without a class
/// (plain anyhow) report as Unknown.
pub fn exit_code(err: &Error) -> i32 {
    match err.downcast_ref::<VaultError>() {
        Some(e) => e.class.code(),
        None => ErrorClass::Unknown.code(),
    }
}

/// Error class of a propagated error, Unknown when unclassified.
pub fn error_class(err: &Error) -> ErrorClass {
    match err.downcast_ref::<VaultError>() {
        Some(e) => e.class,
        None => ErrorClass::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for class in [
            ErrorClass::Assert,
            ErrorClass::Checksum,
            ErrorClass::FileMissing,
            ErrorClass::LockAcquire,
            ErrorClass::Crypto,
            ErrorClass::Format,
            ErrorClass::TermSignal,
            ErrorClass::Protocol,
        ] {
            assert_eq!(ErrorClass::from_code(class.code()), class);
        }
    }

    #[test]
    fn downcast_exit_code() {
        let err: Error = VaultError::new(ErrorClass::Format, "bad tag").into();
        assert_eq!(exit_code(&err), 55);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code(&plain), 99);
    }
}
