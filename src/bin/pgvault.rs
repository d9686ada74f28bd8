//! Command line entry point.
//!
//! Parses the command and options, resolves the configuration, dispatches,
//! and reports the outcome. Worker roles (`:local`, `:remote`) receive
//! their configuration over the protocol instead of the command line, so
//! their stdout stays reserved for protocol frames and logging goes to
//! stderr.

use std::time::Instant;

use anyhow::Error;
use clap::Parser;
use log::{error, info};

use pgvault::command;
use pgvault::config::{self, CommandLine, CommandRole, Config};
use pgvault::error::{error_class, exit_code};
use pgvault::protocol::server::read_config_prelude;

#[derive(Parser)]
#[command(name = "pgvault", disable_help_subcommand = true)]
struct Cli {
    /// Command to run, with an optional role suffix (e.g. backup,
    /// archive-push:async).
    command: String,

    /// Command parameters (WAL paths, repository paths).
    parameters: Vec<String>,

    /// Configuration file path.
    #[arg(long)]
    config: Option<String>,

    /// Stanza name.
    #[arg(long)]
    stanza: Option<String>,

    /// Any option as key=value; repeatable.
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Output format for info/repo-ls (text, json).
    #[arg(long)]
    output: Option<String>,

    /// Backup set for restore/info.
    #[arg(long)]
    set: Option<String>,

    /// Backup type (full, diff, incr).
    #[arg(long = "type")]
    backup_type: Option<String>,

    #[arg(long)]
    delta: bool,

    #[arg(long)]
    force: bool,
}

fn command_line(cli: Cli) -> Result<CommandLine, Error> {
    let (command, role) = match cli.command.split_once(':') {
        Some((command, role)) => (command.to_string(), CommandRole::parse(role)?),
        None => (cli.command.clone(), CommandRole::Default),
    };

    let mut options = std::collections::HashMap::new();
    for raw in &cli.options {
        let (key, value) = raw.split_once('=').ok_or_else(|| {
            pgvault::error::vault_err(
                pgvault::error::ErrorClass::Option,
                format!("option '{}' is not in key=value form", raw),
            )
        })?;
        options.insert(key.to_string(), value.to_string());
    }

    if let Some(stanza) = cli.stanza {
        options.insert(String::from("stanza"), stanza);
    }
    if let Some(output) = cli.output {
        options.insert(String::from("output"), output);
    }
    if let Some(set) = cli.set {
        options.insert(String::from("set"), set);
    }
    if let Some(backup_type) = cli.backup_type {
        options.insert(String::from("type"), backup_type);
    }
    if cli.delta {
        options.insert(String::from("delta"), String::from("y"));
    }
    if cli.force {
        options.insert(String::from("force"), String::from("y"));
    }

    Ok(CommandLine {
        command,
        role,
        parameters: cli.parameters,
        config_file: cli.config,
        options,
    })
}

fn init_logging(level: &str) {
    let level = match level {
        "off" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "detail" | "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = command_line(Cli::parse())?;

    // Worker roles: configuration arrives as the first protocol message.
    let config: Config = match cli.role {
        CommandRole::Local | CommandRole::Remote => {
            let value = read_config_prelude(&mut std::io::stdin())?;
            let mut config: Config = serde_json::from_value(value).map_err(|err| {
                pgvault::error::vault_err(
                    pgvault::error::ErrorClass::Protocol,
                    format!("invalid worker configuration - {}", err),
                )
            })?;
            config.role = cli.role;
            config
        }
        _ => config::load(&cli)?,
    };

    init_logging(&config.log_level);

    let start = Instant::now();
    let command = format!("{}{}", config.command, config.role.suffix());
    info!("{} command begin", command);

    match command::run(&config, &cli) {
        Ok(code) => {
            info!(
                "{} command end: completed successfully ({}ms)",
                command,
                start.elapsed().as_millis()
            );
            Ok(code)
        }
        Err(err) => {
            let class = error_class(&err);
            if class.user_reported() {
                error!("[{}]: {}", class.code(), err);
            } else {
                error!("[{}]: {:#}", class.code(), err);
            }
            info!("{} command end: aborted with exception [{}]", command, class.code());
            Ok(exit_code(&err))
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            // Errors before logging is up still need a report.
            eprintln!("ERROR [{}]: {:#}", exit_code(&err), err);
            exit_code(&err)
        }
    };

    std::process::exit(code);
}
