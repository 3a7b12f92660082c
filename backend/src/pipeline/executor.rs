//! Deadline-bounded execution of blocking work.
//!
//! The work runs on the blocking thread pool and is raced against a timer.
//! Whichever finishes first decides the outcome. On timeout the work is only
//! abandoned: it keeps running to completion and its result is dropped.

use std::time::{Duration, Instant};

use super::error::{InferenceError, PipelineError};

/// Default inference deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

pub async fn run_bounded<T, F>(deadline: Duration, work: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    let start = Instant::now();
    let handle = tokio::task::spawn_blocking(work);

    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(outcome)) => {
            log::debug!("Bounded work finished in {:?}", start.elapsed());
            outcome
        }
        Ok(Err(join_error)) => {
            log::error!("Bounded work failed to complete: {}", join_error);
            Err(InferenceError::Aborted(join_error.to_string()).into())
        }
        Err(_) => {
            log::warn!("Bounded work exceeded its {:?} deadline, abandoning", deadline);
            Err(PipelineError::Timeout(deadline))
        }
    }
}
