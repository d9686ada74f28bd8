//! Start and stop commands.
//!
//! Stop writes a stop file that mutating commands check before running;
//! start removes it. `stop --force` additionally removes lock files left by
//! dead processes so a wedged stanza can be recovered without hunting PIDs.

use anyhow::Error;
use log::{info, warn};

use crate::config::Config;
use crate::lock::{lock_file_path, stop_clear, stop_set, LockType};

pub fn cmd_start(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza.as_deref();

    if stop_clear(&config.lock_path, stanza)? {
        info!("started {}", scope(stanza));
    } else {
        warn!("{} is already started", scope(stanza));
    }
    Ok(0)
}

pub fn cmd_stop(config: &Config) -> Result<i32, Error> {
    let stanza = config.stanza.as_deref();

    let path = stop_set(&config.lock_path, stanza)?;
    info!("stopped {} ({})", scope(stanza), path.display());

    if config.force {
        if let Some(stanza) = stanza {
            for lock_type in [LockType::Archive, LockType::Backup] {
                let lock = lock_file_path(&config.lock_path, stanza, lock_type);
                if lock.exists() {
                    warn!("removing lock file '{}'", lock.display());
                    let _ = std::fs::remove_file(lock);
                }
            }
        }
    }

    Ok(0)
}

fn scope(stanza: Option<&str>) -> String {
    match stanza {
        Some(stanza) => format!("stanza '{}'", stanza),
        None => String::from("all stanzas"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load, CommandLine, CommandRole};
    use crate::lock::stop_check;

    fn config_for(dir: &tempfile::TempDir, command: &str, extra: &[(&str, &str)]) -> Config {
        let mut options = std::collections::HashMap::new();
        options.insert(
            "lock-path".to_string(),
            dir.path().to_str().unwrap().to_string(),
        );
        for (key, value) in extra {
            options.insert(key.to_string(), value.to_string());
        }

        load(&CommandLine {
            command: command.to_string(),
            role: CommandRole::Default,
            parameters: Vec::new(),
            config_file: Some(String::from("/nonexistent")),
            options,
        })
        .unwrap()
    }

    #[test]
    fn stop_then_start_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().to_str().unwrap().to_string();

        cmd_stop(&config_for(&dir, "stop", &[("stanza", "main")])).unwrap();
        assert!(stop_check(&lock_path, Some("main")).is_err());

        cmd_start(&config_for(&dir, "start", &[("stanza", "main")])).unwrap();
        assert!(stop_check(&lock_path, Some("main")).is_ok());
    }

    #[test]
    fn stop_force_clears_locks() {
        let dir = tempfile::tempdir().unwrap();

        // Simulate a stale lock file from a dead process.
        let lock = lock_file_path(dir.path().to_str().unwrap(), "main", LockType::Archive);
        std::fs::write(&lock, b"99999\n").unwrap();

        cmd_stop(&config_for(&dir, "stop", &[("stanza", "main"), ("force", "y")])).unwrap();
        assert!(!lock.exists());
    }

    #[test]
    fn global_stop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().to_str().unwrap().to_string();

        cmd_stop(&config_for(&dir, "stop", &[])).unwrap();
        assert!(stop_check(&lock_path, Some("any")).is_err());
        cmd_start(&config_for(&dir, "start", &[])).unwrap();
        assert!(stop_check(&lock_path, Some("any")).is_ok());
    }
}
