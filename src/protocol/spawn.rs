//! Worker process spawning.
//!
//! Local workers are the current executable re-run with a `:local` command
//! suffix; remote workers run the same binary over ssh with `:remote`. Both
//! read their configuration from the master as the first protocol message,
//! so the spawned command line stays minimal. The async archive daemon is
//! spawned detached instead, with its options on the command line, because
//! it outlives the parent.

use std::os::unix::io::AsRawFd;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Error};

use crate::config::{CommandLine, Config};
use crate::error::{vault_err, ErrorClass};

use super::{ProtocolClient, PROTOCOL_CMD_CONFIG};

/// A spawned worker with its protocol connection. Dropping the handle after
/// `exit` lets the worker observe EOF and terminate.
pub struct Worker {
    pub child: Child,
    pub client: ProtocolClient,
}

fn current_exe() -> Result<String, Error> {
    Ok(std::env::current_exe()
        .context("unable to find executable")?
        .to_string_lossy()
        .into_owned())
}

fn connect(mut child: Child, config: &Config, command: &str) -> Result<Worker, Error> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| vault_err(ErrorClass::Protocol, "worker stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| vault_err(ErrorClass::Protocol, "worker stdout not captured"))?;

    let fd = stdout.as_raw_fd();
    let pid = child.id() as i32;
    let mut client = ProtocolClient::new(Box::new(stdin), Box::new(stdout), fd, pid);

    // Configuration prelude: the worker inherits the master's resolved
    // options with only the command name changed.
    let mut worker_config = config.clone();
    worker_config.command = command.to_string();
    client.send(PROTOCOL_CMD_CONFIG, &[serde_json::to_value(&worker_config)?])?;

    Ok(Worker { child, client })
}

/// Fork a local worker for the given command.
pub fn spawn_local(config: &Config, command: &str) -> Result<Worker, Error> {
    let child = Command::new(current_exe()?)
        .arg(format!("{}:local", command))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| {
            vault_err(
                ErrorClass::HostConnect,
                format!("unable to spawn local worker - {}", err),
            )
        })?;

    connect(child, config, command)
}

/// Spawn a remote server over ssh on the repository host.
pub fn spawn_remote(config: &Config, command: &str) -> Result<Worker, Error> {
    let host = config.repo_host.as_deref().ok_or_else(|| {
        vault_err(ErrorClass::Option, "option 'repo-host' is required for a remote worker")
    })?;

    let target = match &config.repo_host_user {
        Some(user) => format!("{}@{}", user, host),
        None => host.to_string(),
    };

    let child = Command::new("ssh")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("Compression=no")
        .arg(target)
        .arg("pgvault")
        .arg(format!("{}:remote", command))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| {
            vault_err(
                ErrorClass::HostConnect,
                format!("unable to connect to '{}' - {}", host, err),
            )
        })?;

    connect(child, config, command)
}

/// Spawn the pool of workers for a parallel command: remote when a
/// repository host is configured, local otherwise.
pub fn spawn_pool(config: &Config, command: &str, count: u32) -> Result<Vec<Worker>, Error> {
    (0..count.max(1))
        .map(|_| {
            if config.repo_host.is_some() {
                spawn_remote(config, command)
            } else {
                spawn_local(config, command)
            }
        })
        .collect()
}

/// Spawn the detached async archive daemon. The daemon resolves options
/// from its own command line since the parent will not wait for it.
pub fn spawn_async(cli: &CommandLine, command: &str) -> Result<u32, Error> {
    let mut spawn = Command::new(current_exe()?);
    spawn.arg(format!("{}:async", command));

    if let Some(file) = &cli.config_file {
        spawn.arg("--config").arg(file);
    }
    for (key, value) in &cli.options {
        spawn.arg("-o").arg(format!("{}={}", key, value));
    }
    for parameter in &cli.parameters {
        spawn.arg(parameter);
    }

    let child = spawn
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            vault_err(
                ErrorClass::HostConnect,
                format!("unable to spawn async daemon - {}", err),
            )
        })?;

    Ok(child.id())
}

/// Ask every worker to exit and reap the processes.
pub fn shutdown(workers: Vec<Worker>) {
    let mut children = Vec::new();
    for mut worker in workers {
        worker.client.exit();
        children.push(worker.child);
        // Client drops here, closing the pipes.
    }
    for mut child in children {
        let _ = child.wait();
    }
}

/// Split workers into their protocol clients and child handles.
pub fn into_clients(workers: Vec<Worker>) -> (Vec<ProtocolClient>, Vec<Child>) {
    let mut clients = Vec::new();
    let mut children = Vec::new();
    for worker in workers {
        clients.push(worker.client);
        children.push(worker.child);
    }
    (clients, children)
}

/// Reap worker processes after their clients were consumed elsewhere.
pub fn reap(children: Vec<Child>) {
    for mut child in children {
        let _ = child.wait();
    }
}
