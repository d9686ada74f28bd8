//! Small shared helpers.

use std::time::Duration;

use anyhow::Error;
use log::warn;

pub mod runtime;

/// Retry an operation with bounded attempts and exponential backoff.
/// Used by object store drivers for retriable remote failures; the last
/// error escalates to the caller.
pub fn retry<T, F>(what: &str, attempts: usize, base_delay: Duration, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    let mut delay = base_delay;

    for attempt in 1.. {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!("{} failed (attempt {} of {}) - {:#}", what, attempt, attempts, err);
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!()
}

/// Render a byte count with binary unit suffix, for log and info output.
pub fn size_format(size: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("GB", 1024 * 1024 * 1024),
        ("MB", 1024 * 1024),
        ("KB", 1024),
        ("B", 1),
    ];

    for (unit, factor) in UNITS {
        if size >= factor {
            let value = size as f64 / factor as f64;
            return if value >= 100.0 || factor == 1 {
                format!("{:.0}{}", value, unit)
            } else {
                format!("{:.1}{}", value, unit)
            };
        }
    }

    String::from("0B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_succeeds_after_failures() {
        let mut calls = 0;
        let result = retry("op", 3, Duration::from_millis(1), || {
            calls += 1;
            if calls < 3 {
                anyhow::bail!("transient")
            }
            Ok(calls)
        })
        .unwrap();
        assert_eq!(result, 3);
    }

    #[test]
    fn retry_exhausts() {
        let result: Result<(), Error> =
            retry("op", 2, Duration::from_millis(1), || anyhow::bail!("always"));
        assert!(result.is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!(size_format(0), "0B");
        assert_eq!(size_format(999), "999B");
        assert_eq!(size_format(2048), "2.0KB");
        assert_eq!(size_format(16 * 1024 * 1024), "16.0MB");
    }
}
