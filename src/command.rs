//! User-visible commands.
//!
//! Each command is a workflow over the lower layers; the entry point
//! dispatches here after option resolution. Commands return an exit code:
//! 0 for success, 1 for command-defined non-fatal results (archive-get
//! reporting a missing segment). Errors propagate to the entry point which
//! maps them to their class code.

use anyhow::Error;

use crate::config::{CommandLine, CommandRole, Config};
use crate::error::{vault_err, ErrorClass};

pub mod archive_get;
pub mod archive_push;
pub mod backup;
pub mod check;
pub mod expire;
pub mod info;
pub mod local;
pub mod remote;
pub mod repo;
pub mod restore;
pub mod stanza;
pub mod start_stop;
pub mod verify;

/// Dispatch the resolved command.
pub fn run(config: &Config, cli: &CommandLine) -> Result<i32, Error> {
    match (config.command.as_str(), config.role) {
        ("archive-push", CommandRole::Default) => archive_push::cmd_archive_push(config, cli),
        ("archive-push", CommandRole::Async) => archive_push::cmd_archive_push_async(config),
        ("archive-get", CommandRole::Default) => archive_get::cmd_archive_get(config, cli),
        ("archive-get", CommandRole::Async) => archive_get::cmd_archive_get_async(config, cli),

        ("backup", CommandRole::Default) => backup::cmd_backup(config),
        ("restore", CommandRole::Default) => restore::cmd_restore(config),
        ("expire", CommandRole::Default) => expire::cmd_expire(config),
        ("info", CommandRole::Default) => info::cmd_info(config),
        ("check", CommandRole::Default) => check::cmd_check(config),
        ("verify", CommandRole::Default) => verify::cmd_verify(config),

        ("stanza-create", CommandRole::Default) => stanza::cmd_stanza_create(config),
        ("stanza-upgrade", CommandRole::Default) => stanza::cmd_stanza_upgrade(config),
        ("stanza-delete", CommandRole::Default) => stanza::cmd_stanza_delete(config),

        ("repo-ls", CommandRole::Default) => repo::cmd_repo_ls(config, cli),
        ("repo-get", CommandRole::Default) => repo::cmd_repo_get(config, cli),
        ("repo-put", CommandRole::Default) => repo::cmd_repo_put(config, cli),
        ("repo-rm", CommandRole::Default) => repo::cmd_repo_rm(config, cli),

        ("start", CommandRole::Default) => start_stop::cmd_start(config),
        ("stop", CommandRole::Default) => start_stop::cmd_stop(config),

        // Worker roles serve the protocol until the master hangs up.
        (_, CommandRole::Local) => local::cmd_local(config),
        (_, CommandRole::Remote) => remote::cmd_remote(config),

        (command, _) => Err(vault_err(
            ErrorClass::CommandInvalid,
            format!("invalid command '{}{}'", command, config.role.suffix()),
        )),
    }
}
