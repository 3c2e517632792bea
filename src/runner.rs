//! Blocking pipeline runs under an external deadline.
//!
//! `spawn_blocking` work cannot be cancelled, and dropping a runtime waits for
//! it. [`block_on_detached`] shuts the runtime down in the background instead,
//! so a run that hit its deadline does not keep the process alive.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinError;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("blocking job exceeded the {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("blocking job panicked")]
    Panicked(#[source] JoinError),
}

/// Multi-thread runtime with io and time drivers enabled.
///
/// # Errors
/// When the runtime's worker threads cannot be spawned.
pub fn build_runtime() -> std::io::Result<Runtime> {
    Builder::new_multi_thread().enable_all().build()
}

/// Runs `job` on the blocking pool, giving up after `deadline`.
///
/// # Errors
/// `DeadlineExceeded` when the deadline passes first, `Panicked` when the job panics.
pub async fn run_blocking<T, F>(deadline: Option<Duration>, job: F) -> Result<T, RunnerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let worker = tokio::task::spawn_blocking(job);
    let joined = match deadline {
        Some(limit) => tokio::time::timeout(limit, worker).await.map_err(|_| {
            warn!(deadline_ms = limit.as_millis(), "blocking job abandoned at deadline");
            RunnerError::DeadlineExceeded(limit)
        })?,
        None => worker.await,
    };
    joined.map_err(RunnerError::Panicked)
}

/// Drives `future` to completion, then drops the runtime without joining
/// blocking threads that are still running.
pub fn block_on_detached<F: Future>(runtime: Runtime, future: F) -> F::Output {
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn deadline_returns_without_waiting_for_the_worker() {
        let runtime = build_runtime().expect("runtime");
        let started = Instant::now();
        let result = block_on_detached(
            runtime,
            run_blocking(Some(Duration::from_millis(100)), || {
                std::thread::sleep(Duration::from_secs(3));
                7
            }),
        );
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(RunnerError::DeadlineExceeded(_))));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn job_within_deadline_returns_its_value() {
        let runtime = build_runtime().expect("runtime");
        let result = block_on_detached(
            runtime,
            run_blocking(Some(Duration::from_secs(5)), || 21 * 2),
        );
        assert_eq!(result.expect("finished in time"), 42);
    }

    #[test]
    fn no_deadline_waits_for_completion() {
        let runtime = build_runtime().expect("runtime");
        let result = block_on_detached(
            runtime,
            run_blocking(None, || {
                std::thread::sleep(Duration::from_millis(50));
                "done"
            }),
        );
        assert_eq!(result.expect("completed"), "done");
    }

    #[test]
    fn panicking_job_is_reported() {
        let runtime = build_runtime().expect("runtime");
        let result: Result<(), _> = block_on_detached(
            runtime,
            run_blocking(None, || panic!("worker failed")),
        );
        assert!(matches!(result, Err(RunnerError::Panicked(_))));
    }
}
