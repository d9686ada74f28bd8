//! Parallel job executor.
//!
//! Drives a pool of protocol clients: every idle client is assigned a fresh
//! job from the generator callback, the pool is polled with a deadline, and
//! completed jobs surface in completion order (not submission order - the
//! caller reorders by key when it matters). A failed job is retried on its
//! client after the configured interval until its retry budget is spent,
//! then the error surfaces with the worker's stack attached.

use std::time::{Duration, Instant};

use anyhow::Error;
use nix::poll::{poll, PollFd, PollFlags};
use serde_json::Value;

use crate::error::{vault_err, ErrorClass};

use super::ProtocolClient;

/// One unit of work for a worker.
#[derive(Debug, Clone)]
pub struct ExecutorJob {
    /// Identifier returned with the completion, e.g. the WAL segment name.
    pub key: String,
    pub cmd: String,
    pub parameter: Vec<Value>,
    pub retries: u32,
    pub retry_interval: Duration,
}

impl ExecutorJob {
    pub fn new(key: impl Into<String>, cmd: impl Into<String>, parameter: Vec<Value>) -> Self {
        ExecutorJob {
            key: key.into(),
            cmd: cmd.into(),
            parameter,
            retries: 0,
            retry_interval: Duration::from_secs(0),
        }
    }

    pub fn retry(mut self, retries: u32, interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = interval;
        self
    }
}

/// Completion record surfaced to the caller.
pub struct ExecutorResult {
    pub key: String,
    pub out: Result<Value, Error>,
    pub retries_used: u32,
    /// Worker process id, for log correlation.
    pub pid: i32,
}

enum SlotState {
    Idle,
    Busy,
    Wait { resume: Instant },
}

struct Slot {
    client: ProtocolClient,
    state: SlotState,
    job: Option<ExecutorJob>,
    attempts: u32,
}

pub struct ParallelExecutor<'a> {
    slots: Vec<Slot>,
    generator: Box<dyn FnMut() -> Option<ExecutorJob> + 'a>,
    timeout: Duration,
}

impl<'a> ParallelExecutor<'a> {
    pub fn new(
        clients: Vec<ProtocolClient>,
        timeout: Duration,
        generator: impl FnMut() -> Option<ExecutorJob> + 'a,
    ) -> Self {
        ParallelExecutor {
            slots: clients
                .into_iter()
                .map(|client| Slot {
                    client,
                    state: SlotState::Idle,
                    job: None,
                    attempts: 0,
                })
                .collect(),
            generator: Box::new(generator),
            timeout,
        }
    }

    /// Run until the generator drains and every job has completed. Returns
    /// the total number of jobs processed.
    pub fn run(
        &mut self,
        mut on_result: impl FnMut(ExecutorResult) -> Result<(), Error>,
    ) -> Result<u64, Error> {
        let deadline = Instant::now() + self.timeout;
        let mut drained = false;
        let mut completed: u64 = 0;

        loop {
            let now = Instant::now();

            // Re-dispatch jobs whose retry interval has elapsed.
            for slot in self.slots.iter_mut() {
                if let SlotState::Wait { resume } = slot.state {
                    if resume <= now {
                        dispatch(slot)?;
                    }
                }
            }

            // Hand a fresh job to every idle client.
            if !drained {
                for slot in self.slots.iter_mut() {
                    if matches!(slot.state, SlotState::Idle) {
                        match (self.generator)() {
                            Some(job) => {
                                slot.job = Some(job);
                                slot.attempts = 0;
                                dispatch(slot)?;
                            }
                            None => {
                                drained = true;
                                break;
                            }
                        }
                    }
                }
            }

            if drained
                && self
                    .slots
                    .iter()
                    .all(|slot| matches!(slot.state, SlotState::Idle))
            {
                return Ok(completed);
            }

            // Poll the busy clients; cap the wait at the nearest retry
            // resume time and the overall deadline.
            let busy: Vec<usize> = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| matches!(slot.state, SlotState::Busy))
                .map(|(index, _)| index)
                .collect();

            let mut wait = deadline.saturating_duration_since(now);
            for slot in self.slots.iter() {
                if let SlotState::Wait { resume } = slot.state {
                    wait = wait.min(resume.saturating_duration_since(now));
                }
            }

            if busy.is_empty() {
                if Instant::now() >= deadline {
                    return Err(vault_err(ErrorClass::Protocol, "command timeout exceeded"));
                }
                std::thread::sleep(wait.min(Duration::from_millis(100)));
                continue;
            }

            let mut fds: Vec<PollFd> = busy
                .iter()
                .map(|index| PollFd::new(self.slots[*index].client.fd(), PollFlags::POLLIN))
                .collect();

            let events = poll(&mut fds, wait.as_millis().min(i32::MAX as u128) as i32)
                .map_err(|err| vault_err(ErrorClass::Protocol, format!("poll failed - {}", err)))?;

            if events == 0 {
                if Instant::now() >= deadline {
                    return Err(vault_err(ErrorClass::Protocol, "command timeout exceeded"));
                }
                continue;
            }

            let ready: Vec<usize> = fds
                .iter()
                .zip(busy.iter())
                .filter(|(fd, _)| {
                    fd.revents()
                        .map(|revents| {
                            revents.intersects(
                                PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                            )
                        })
                        .unwrap_or(false)
                })
                .map(|(_, index)| *index)
                .collect();

            for index in ready {
                let slot = &mut self.slots[index];
                let response = slot.client.receive();

                match response {
                    Ok(out) => {
                        let job = slot.job.take().unwrap();
                        slot.state = SlotState::Idle;
                        completed += 1;
                        on_result(ExecutorResult {
                            key: job.key,
                            out: Ok(out),
                            retries_used: slot.attempts - 1,
                            pid: slot.client.pid(),
                        })?;
                    }
                    Err(err) => {
                        let job = slot.job.as_ref().unwrap();
                        if slot.attempts <= job.retries {
                            slot.state = SlotState::Wait {
                                resume: Instant::now() + job.retry_interval,
                            };
                        } else {
                            let job = slot.job.take().unwrap();
                            slot.state = SlotState::Idle;
                            completed += 1;
                            on_result(ExecutorResult {
                                key: job.key,
                                out: Err(err),
                                retries_used: slot.attempts - 1,
                                pid: slot.client.pid(),
                            })?;
                        }
                    }
                }
            }
        }
    }

    /// Tell every worker to exit and hand the clients back.
    pub fn finish(mut self) -> Vec<ProtocolClient> {
        for slot in self.slots.iter_mut() {
            slot.client.exit();
        }
        self.slots.into_iter().map(|slot| slot.client).collect()
    }
}

fn dispatch(slot: &mut Slot) -> Result<(), Error> {
    let job = slot.job.as_ref().unwrap();
    slot.attempts += 1;
    slot.state = SlotState::Busy;
    // A dead worker surfaces at receive time through the poll loop.
    let _ = slot.client.send(&job.cmd, &job.parameter);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs::File;
    use std::os::unix::io::FromRawFd;

    use serde_json::json;

    use super::*;
    use crate::protocol::{error_line, response_line};

    // A client whose worker responses are pre-written into a real pipe so
    // that poll() sees the descriptor as readable.
    fn canned_client(pid: i32, responses: &[String]) -> ProtocolClient {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let mut write = unsafe { File::from_raw_fd(write_fd) };
        for response in responses {
            use std::io::Write;
            write.write_all(response.as_bytes()).unwrap();
        }
        // The write side doubles as the client's request sink; requests
        // land after the canned responses and are never read back.
        let read = unsafe { File::from_raw_fd(read_fd) };
        ProtocolClient::new(Box::new(write), Box::new(read), read_fd, pid)
    }

    #[test]
    fn jobs_complete_exactly_once() {
        let client1 = canned_client(
            101,
            &[
                response_line(&json!("done")),
                response_line(&json!("done")),
                response_line(&json!("done")),
            ],
        );
        let client2 = canned_client(
            102,
            &[response_line(&json!("done")), response_line(&json!("done"))],
        );

        let mut pending: Vec<ExecutorJob> = (1..=5)
            .map(|n| ExecutorJob::new(format!("S{}", n), "archive-get-file", vec![]))
            .collect();
        pending.reverse();

        let mut executor = ParallelExecutor::new(
            vec![client1, client2],
            Duration::from_secs(5),
            move || pending.pop(),
        );

        let mut seen = HashMap::new();
        let total = executor
            .run(|result| {
                *seen.entry(result.key.clone()).or_insert(0) += 1;
                assert!(result.out.is_ok());
                Ok(())
            })
            .unwrap();

        assert_eq!(total, 5);
        assert_eq!(seen.len(), 5);
        assert!(seen.values().all(|count| *count == 1));
    }

    #[test]
    fn failed_job_retries_then_succeeds() {
        let err = crate::error::vault_err(crate::error::ErrorClass::FileRead, "flaky");
        let client = canned_client(
            201,
            &[error_line(&err), response_line(&json!("recovered"))],
        );

        let mut jobs = vec![ExecutorJob::new("S3", "archive-get-file", vec![])
            .retry(1, Duration::from_millis(10))];

        let mut executor =
            ParallelExecutor::new(vec![client], Duration::from_secs(5), move || jobs.pop());

        let mut results = Vec::new();
        executor
            .run(|result| {
                results.push((result.key.clone(), result.retries_used, result.out.is_ok()));
                Ok(())
            })
            .unwrap();

        assert_eq!(results, vec![("S3".to_string(), 1, true)]);
    }

    #[test]
    fn exhausted_retries_surface_error() {
        let err = crate::error::vault_err(crate::error::ErrorClass::FileRead, "always broken");
        let client = canned_client(
            301,
            &[error_line(&err), error_line(&err), error_line(&err)],
        );

        let mut jobs =
            vec![ExecutorJob::new("S9", "archive-push-file", vec![]).retry(2, Duration::from_millis(1))];

        let mut executor =
            ParallelExecutor::new(vec![client], Duration::from_secs(5), move || jobs.pop());

        let mut failures = 0;
        executor
            .run(|result| {
                assert_eq!(result.key, "S9");
                assert_eq!(result.retries_used, 2);
                assert!(result.out.is_err());
                failures += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(failures, 1);
    }

    #[test]
    fn empty_generator_terminates() {
        let mut executor =
            ParallelExecutor::new(Vec::new(), Duration::from_millis(100), || None);
        let total = executor.run(|_| Ok(())).unwrap();
        assert_eq!(total, 0);
    }
}
