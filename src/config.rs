//! Option resolution and the runtime configuration.
//!
//! Options resolve from four layers, lowest to highest precedence:
//! defaults, environment variables (`PGVAULT_<OPTION>`, uppercased with
//! dashes as underscores), the config file (`[global]`, `[<stanza>]`,
//! `[global:<command>]`, `[<stanza>:<command>]` sections), and the command
//! line. The result is frozen into a [`Config`] value at command begin and
//! passed by reference everywhere after; workers receive the same value as
//! the protocol configuration prelude.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::crypt::{CipherConfig, CipherType};
use crate::error::{vault_err, ErrorClass};
use crate::io::compress::CompressType;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/pgvault/pgvault.conf";
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

const ENV_PREFIX: &str = "PGVAULT_";

/// Role a process plays; selected with a `:role` suffix on the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandRole {
    Default,
    Async,
    Local,
    Remote,
}

impl CommandRole {
    pub fn parse(value: &str) -> Result<CommandRole, Error> {
        match value {
            "" => Ok(CommandRole::Default),
            "async" => Ok(CommandRole::Async),
            "local" => Ok(CommandRole::Local),
            "remote" => Ok(CommandRole::Remote),
            _ => Err(vault_err(
                ErrorClass::CommandInvalid,
                format!("invalid command role '{}'", value),
            )),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            CommandRole::Default => "",
            CommandRole::Async => ":async",
            CommandRole::Local => ":local",
            CommandRole::Remote => ":remote",
        }
    }
}

/// Resolved configuration, immutable after command begin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub command: String,
    pub role: CommandRole,
    pub stanza: Option<String>,

    pub repo_path: String,
    pub repo_type: String,
    pub repo_cipher_type: String,
    pub repo_cipher_pass: Option<String>,
    pub repo_retention_full: Option<u32>,
    pub repo_retention_archive: Option<u32>,
    pub repo_host: Option<String>,
    pub repo_host_user: Option<String>,

    pub repo_s3_bucket: Option<String>,
    pub repo_s3_region: Option<String>,
    pub repo_s3_endpoint: Option<String>,
    pub repo_s3_key: Option<String>,
    pub repo_s3_key_secret: Option<String>,
    pub repo_s3_token: Option<String>,

    pub repo_azure_account: Option<String>,
    pub repo_azure_container: Option<String>,
    pub repo_azure_key: Option<String>,
    pub repo_azure_sas: Option<String>,

    pub pg_path: Option<String>,
    pub pg_version: Option<String>,
    pub pg_system_id: Option<u64>,
    pub pg_catalog_version: Option<u32>,
    pub pg_control_version: Option<u32>,
    pub wal_segment_size: u64,

    pub spool_path: String,
    pub lock_path: String,

    pub process_max: u32,
    pub compress_type: String,
    pub compress_level: u32,

    pub archive_async: bool,
    pub archive_timeout: Duration,
    pub archive_get_queue_max: u64,
    pub protocol_timeout: Duration,

    pub backup_type: String,
    pub delta: bool,
    pub force: bool,
    pub output: String,
    pub set: Option<String>,

    pub log_level: String,
}

impl Config {
    pub fn stanza(&self) -> Result<&str, Error> {
        self.stanza.as_deref().ok_or_else(|| {
            vault_err(ErrorClass::Option, "option 'stanza' is required for this command")
        })
    }

    pub fn compress(&self) -> Result<CompressType, Error> {
        CompressType::parse(&self.compress_type)
    }

    pub fn cipher_type(&self) -> Result<CipherType, Error> {
        CipherType::parse(&self.repo_cipher_type)
    }

    /// Cipher for the info files, built from the user passphrase.
    pub fn cipher(&self) -> Result<Option<CipherConfig>, Error> {
        match self.cipher_type()? {
            CipherType::None => Ok(None),
            CipherType::Aes256Cbc => {
                let pass = self.repo_cipher_pass.as_deref().ok_or_else(|| {
                    vault_err(
                        ErrorClass::Option,
                        "option 'repo-cipher-pass' is required when repo cipher is set",
                    )
                })?;
                Ok(Some(CipherConfig::new(pass)?))
            }
        }
    }
}

/// Raw option values from the command line, highest precedence layer.
#[derive(Debug, Default, Clone)]
pub struct CommandLine {
    pub command: String,
    pub role: CommandRole,
    pub parameters: Vec<String>,
    pub config_file: Option<String>,
    pub options: HashMap<String, String>,
}

impl Default for CommandRole {
    fn default() -> Self {
        CommandRole::Default
    }
}

// One section of the config file: raw key/value pairs.
type Section = HashMap<String, String>;

fn parse_config_file(contents: &str) -> Result<HashMap<String, Section>, Error> {
    let mut sections: HashMap<String, Section> = HashMap::new();
    let mut current: Option<String> = None;

    for (number, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            current = Some(line[1..line.len() - 1].to_string());
            sections.entry(current.clone().unwrap()).or_default();
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            vault_err(
                ErrorClass::Config,
                format!("invalid config line {} '{}'", number + 1, raw),
            )
        })?;

        let section = current.as_ref().ok_or_else(|| {
            vault_err(
                ErrorClass::Config,
                format!("config line {} is outside any section", number + 1),
            )
        })?;

        sections
            .get_mut(section)
            .unwrap()
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(sections)
}

/// Layered option lookup.
struct Resolver {
    cli: HashMap<String, String>,
    file: HashMap<String, Section>,
    command: String,
    stanza: Option<String>,
}

impl Resolver {
    fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.cli.get(name) {
            return Some(value.clone());
        }

        // Config file sections from most to least specific.
        let mut sections = Vec::new();
        if let Some(stanza) = &self.stanza {
            sections.push(format!("{}:{}", stanza, self.command));
            sections.push(stanza.clone());
        }
        sections.push(format!("global:{}", self.command));
        sections.push(String::from("global"));

        for section in sections {
            if let Some(value) = self.file.get(&section).and_then(|s| s.get(name)) {
                return Some(value.clone());
            }
        }

        let env_name = format!(
            "{}{}",
            ENV_PREFIX,
            name.to_uppercase().replace('-', "_")
        );
        std::env::var(env_name).ok()
    }

    fn string(&self, name: &str, dflt: &str) -> String {
        self.get(name).unwrap_or_else(|| dflt.to_string())
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.get(name)
    }

    fn boolean(&self, name: &str, dflt: bool) -> Result<bool, Error> {
        match self.get(name) {
            None => Ok(dflt),
            Some(value) => parse_bool(&value)
                .ok_or_else(|| option_invalid(name, &value)),
        }
    }

    fn unsigned(&self, name: &str, dflt: u64) -> Result<u64, Error> {
        match self.get(name) {
            None => Ok(dflt),
            Some(value) => value.parse().map_err(|_| option_invalid(name, &value)),
        }
    }

    fn optional_unsigned(&self, name: &str) -> Result<Option<u64>, Error> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| option_invalid(name, &value)),
        }
    }

    fn size(&self, name: &str, dflt: u64) -> Result<u64, Error> {
        match self.get(name) {
            None => Ok(dflt),
            Some(value) => parse_size(&value).ok_or_else(|| option_invalid(name, &value)),
        }
    }

    fn time(&self, name: &str, dflt: Duration) -> Result<Duration, Error> {
        match self.get(name) {
            None => Ok(dflt),
            Some(value) => value
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| option_invalid(name, &value)),
        }
    }
}

fn option_invalid(name: &str, value: &str) -> Error {
    vault_err(
        ErrorClass::Option,
        format!("invalid value '{}' for option '{}'", value, name),
    )
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "y" | "yes" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a size with optional K/M/G/T binary suffix.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, factor) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1024),
        'm' | 'M' => (&value[..value.len() - 1], 1024 * 1024),
        'g' | 'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        't' | 'T' => (&value[..value.len() - 1], 1024u64.pow(4)),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * factor)
}

/// Resolve the full configuration for a parsed command line.
pub fn load(cli: &CommandLine) -> Result<Config, Error> {
    let file = {
        let path = cli
            .config_file
            .clone()
            .or_else(|| std::env::var(format!("{}CONFIG", ENV_PREFIX)).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        match std::fs::read_to_string(&path) {
            Ok(contents) => parse_config_file(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(vault_err(
                    ErrorClass::Config,
                    format!("unable to read config file '{}' - {}", path, err),
                ))
            }
        }
    };

    let resolver = Resolver {
        cli: cli.options.clone(),
        file,
        command: cli.command.clone(),
        stanza: cli.options.get("stanza").cloned().or_else(|| {
            std::env::var(format!("{}STANZA", ENV_PREFIX)).ok()
        }),
    };

    let stanza = resolver.optional("stanza");

    let config = Config {
        command: cli.command.clone(),
        role: cli.role,
        stanza,

        repo_path: resolver.string("repo-path", "/var/lib/pgvault"),
        repo_type: resolver.string("repo-type", "posix"),
        repo_cipher_type: resolver.string("repo-cipher-type", "none"),
        repo_cipher_pass: resolver.optional("repo-cipher-pass"),
        repo_retention_full: resolver.optional_unsigned("repo-retention-full")?.map(|v| v as u32),
        repo_retention_archive: resolver
            .optional_unsigned("repo-retention-archive")?
            .map(|v| v as u32),
        repo_host: resolver.optional("repo-host"),
        repo_host_user: resolver.optional("repo-host-user"),

        repo_s3_bucket: resolver.optional("repo-s3-bucket"),
        repo_s3_region: resolver.optional("repo-s3-region"),
        repo_s3_endpoint: resolver.optional("repo-s3-endpoint"),
        repo_s3_key: resolver.optional("repo-s3-key"),
        repo_s3_key_secret: resolver.optional("repo-s3-key-secret"),
        repo_s3_token: resolver.optional("repo-s3-token"),

        repo_azure_account: resolver.optional("repo-azure-account"),
        repo_azure_container: resolver.optional("repo-azure-container"),
        repo_azure_key: resolver.optional("repo-azure-key"),
        repo_azure_sas: resolver.optional("repo-azure-sas"),

        pg_path: resolver.optional("pg-path"),
        pg_version: resolver.optional("pg-version"),
        pg_system_id: resolver.optional_unsigned("pg-system-id")?,
        pg_catalog_version: resolver.optional_unsigned("pg-catalog-version")?.map(|v| v as u32),
        pg_control_version: resolver.optional_unsigned("pg-control-version")?.map(|v| v as u32),
        wal_segment_size: resolver.size("wal-segment-size", DEFAULT_WAL_SEGMENT_SIZE)?,

        spool_path: resolver.string("spool-path", "/var/spool/pgvault"),
        lock_path: resolver.string("lock-path", "/tmp/pgvault"),

        process_max: resolver.unsigned("process-max", 1)? as u32,
        compress_type: resolver.string("compress-type", "gz"),
        compress_level: resolver.unsigned("compress-level", 6)? as u32,

        archive_async: resolver.boolean("archive-async", false)?,
        archive_timeout: resolver.time("archive-timeout", Duration::from_millis(60_000))?,
        archive_get_queue_max: resolver.size("archive-get-queue-max", 128 * 1024 * 1024)?,
        protocol_timeout: resolver.time("protocol-timeout", Duration::from_millis(1_830_000))?,

        backup_type: resolver.string("type", "incr"),
        delta: resolver.boolean("delta", false)?,
        force: resolver.boolean("force", false)?,
        output: resolver.string("output", "text"),
        set: resolver.optional("set"),

        log_level: resolver.string("log-level-console", "info"),
    };

    if config.process_max < 1 || config.process_max > 999 {
        return Err(vault_err(
            ErrorClass::Option,
            format!("process-max {} is out of range", config.process_max),
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(command: &str, options: &[(&str, &str)]) -> CommandLine {
        CommandLine {
            command: command.to_string(),
            role: CommandRole::Default,
            parameters: Vec::new(),
            config_file: Some(String::from("/nonexistent/pgvault.conf")),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn defaults_apply() {
        let config = load(&cli("backup", &[("stanza", "main")])).unwrap();
        assert_eq!(config.repo_type, "posix");
        assert_eq!(config.compress_type, "gz");
        assert_eq!(config.wal_segment_size, DEFAULT_WAL_SEGMENT_SIZE);
        assert_eq!(config.process_max, 1);
        assert_eq!(config.stanza().unwrap(), "main");
    }

    #[test]
    fn command_line_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[global]\ncompress-type=lz4\nprocess-max=4\n\n[main]\nrepo-path=/repo/main\n\n[main:archive-push]\nprocess-max=8"
        )
        .unwrap();

        let mut cli = cli("archive-push", &[("stanza", "main")]);
        cli.config_file = Some(file.path().to_str().unwrap().to_string());

        let config = load(&cli).unwrap();
        // Stanza:command section beats global.
        assert_eq!(config.process_max, 8);
        assert_eq!(config.compress_type, "lz4");
        assert_eq!(config.repo_path, "/repo/main");

        let mut cli2 = super::CommandLine {
            options: [
                ("stanza".to_string(), "main".to_string()),
                ("process-max".to_string(), "2".to_string()),
            ]
            .into_iter()
            .collect(),
            ..cli
        };
        cli2.command = String::from("archive-push");
        let config = load(&cli2).unwrap();
        assert_eq!(config.process_max, 2);
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("16"), Some(16));
        assert_eq!(parse_size("16M"), Some(16 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("2k"), Some(2048));
        assert_eq!(parse_size("x"), None);
    }

    #[test]
    fn invalid_option_value() {
        let err = load(&cli("backup", &[("stanza", "main"), ("archive-async", "maybe")]))
            .unwrap_err();
        assert_eq!(crate::error::error_class(&err), ErrorClass::Option);
    }

    #[test]
    fn missing_stanza_reported_on_access() {
        let config = load(&cli("info", &[])).unwrap();
        assert!(config.stanza().is_err());
    }

    #[test]
    fn config_round_trips_for_worker_prelude() {
        let config = load(&cli("backup", &[("stanza", "main")])).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back.stanza.as_deref(), Some("main"));
        assert_eq!(back.command, "backup");
    }
}
