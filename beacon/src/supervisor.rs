// ABOUTME: Parent process for multi-worker mode: spawns N copies of the binary sharing one port
// ABOUTME: Forwards SIGINT/SIGTERM to every worker so each runs its own drain, then waits for all

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use crate::signals::ShutdownSignal;

/// Set on every spawned worker; its presence marks a process as a worker.
pub const WORKER_INDEX_VAR: &str = "BEACON_WORKER_INDEX";

pub fn worker_index() -> Option<usize> {
    parse_worker_index(std::env::var(WORKER_INDEX_VAR).ok())
}

fn parse_worker_index(value: Option<String>) -> Option<usize> {
    value.and_then(|v| v.trim().parse().ok())
}

pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    workers: usize,
}

impl Supervisor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, workers: usize) -> Self {
        Self {
            program: program.into(),
            args,
            workers,
        }
    }

    /// Re-run this executable with the same arguments for every worker.
    pub fn for_current_exe(workers: usize) -> std::io::Result<Self> {
        let program = std::env::current_exe()?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self::new(program, args, workers))
    }

    fn spawn_worker(&self, index: usize) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_INDEX_VAR, index.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
    }

    /// Spawn the workers and wait until every one has exited.
    ///
    /// When `shutdown` resolves first, its signal is forwarded to each worker
    /// and the supervisor keeps waiting; it never kills a worker outright.
    pub async fn run<S>(self, shutdown: S) -> std::io::Result<Vec<ExitStatus>>
    where
        S: Future<Output = ShutdownSignal>,
    {
        let mut children = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            match self.spawn_worker(index) {
                Ok(child) => {
                    tracing::info!(index, pid = ?child.id(), "Spawned worker");
                    children.push(child);
                }
                Err(e) => {
                    tracing::error!(index, "Failed to spawn worker: {}", e);
                    forward(&children, ShutdownSignal::Terminate);
                    for child in children.iter_mut() {
                        let _ = child.wait().await;
                    }
                    return Err(e);
                }
            }
        }

        let pids: Vec<u32> = children.iter().filter_map(Child::id).collect();
        tracing::info!(
            workers = self.workers,
            pid = std::process::id(),
            "Supervisor running"
        );

        let waits = futures_util::future::join_all(children.iter_mut().map(|child| child.wait()));
        tokio::pin!(waits);
        tokio::pin!(shutdown);

        let results = tokio::select! {
            results = &mut waits => results,
            signal = &mut shutdown => {
                forward_to_pids(&pids, signal);
                waits.await
            }
        };

        let mut statuses = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            let status = result?;
            if status.success() {
                tracing::info!(index, "Worker exited");
            } else {
                tracing::warn!(index, %status, "Worker exited abnormally");
            }
            statuses.push(status);
        }
        Ok(statuses)
    }
}

fn forward(children: &[Child], signal: ShutdownSignal) {
    let pids: Vec<u32> = children.iter().filter_map(Child::id).collect();
    forward_to_pids(&pids, signal);
}

#[cfg(unix)]
fn forward_to_pids(pids: &[u32], signal: ShutdownSignal) {
    for &pid in pids {
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if rc == 0 {
            tracing::info!(pid, ?signal, "Forwarded signal to worker");
        } else {
            tracing::warn!(
                pid,
                ?signal,
                "Failed to forward signal: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn forward_to_pids(pids: &[u32], signal: ShutdownSignal) {
    tracing::warn!(?pids, ?signal, "Signal forwarding is only supported on unix");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn shell(script: &str, workers: usize) -> Supervisor {
        Supervisor::new("/bin/sh", vec!["-c".into(), script.into()], workers)
    }

    #[test]
    fn test_parse_worker_index() {
        assert_eq!(parse_worker_index(None), None);
        assert_eq!(parse_worker_index(Some("3".into())), Some(3));
        assert_eq!(parse_worker_index(Some(" 0 ".into())), Some(0));
        assert_eq!(parse_worker_index(Some("first".into())), None);
    }

    #[tokio::test]
    async fn test_every_worker_gets_an_index() {
        let supervisor = shell("test -n \"$BEACON_WORKER_INDEX\"", 3);

        let statuses = supervisor
            .run(std::future::pending::<ShutdownSignal>())
            .await
            .unwrap();

        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(ExitStatus::success));
    }

    #[tokio::test]
    async fn test_shutdown_signal_is_forwarded() {
        use std::os::unix::process::ExitStatusExt;

        let supervisor = shell("exec sleep 30", 2);
        let started = Instant::now();

        let statuses = supervisor
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                ShutdownSignal::Terminate
            })
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(statuses.len(), 2);
        for status in statuses {
            assert_eq!(status.signal(), Some(libc::SIGTERM));
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let supervisor = Supervisor::new("/nonexistent/beacon", Vec::new(), 2);
        assert!(supervisor
            .run(std::future::pending::<ShutdownSignal>())
            .await
            .is_err());
    }
}
