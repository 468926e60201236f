//! Timeout policy.
//!
//! Implemented as a race between the wrapped call and a timer linked to a
//! child cancellation token, not by tearing down the work: on timeout the
//! child token is cancelled and the call keeps running in the background
//! until it observes the token cooperatively.

use crate::errors::PolicyError;
use crate::events::EventEmitter;
use crate::executor::{Executor, Failure, Outcome};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// See the module docs.
pub struct TimeoutPolicy<E> {
    executor: Executor<E>,
    duration: Duration,
    on_timeout: EventEmitter<()>,
}

impl<E> Clone for TimeoutPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            duration: self.duration,
            on_timeout: self.on_timeout.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> TimeoutPolicy<E> {
    pub(crate) fn new(executor: Executor<E>, duration: Duration) -> Self {
        Self {
            executor,
            duration,
            on_timeout: EventEmitter::new(),
        }
    }

    /// Fires when a call is abandoned because the timer won the race.
    pub fn on_timeout(&self) -> &EventEmitter<()> {
        &self.on_timeout
    }

    /// Executes the function, handing it a child token that is cancelled when
    /// the timeout elapses or the caller's own token fires.
    pub async fn execute<T, F, Fut>(
        &self,
        f: F,
        cancellation: CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
    {
        let child = cancellation.child_token();
        let start = Instant::now();
        let mut handle = tokio::spawn(f(child.clone()));

        let result = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => return Err(PolicyError::TaskCancelled),
            },
            _ = tokio::time::sleep(self.duration) => {
                child.cancel();
                self.on_timeout.emit(&());
                return Err(PolicyError::Timeout(self.duration));
            }
            _ = cancellation.cancelled() => {
                child.cancel();
                return Err(PolicyError::TaskCancelled);
            }
        };

        match self.executor.classify(result, start.elapsed(), None) {
            Outcome::Success(value) => Ok(value),
            Outcome::Handled(Failure::Error(e)) | Outcome::Unhandled(e) => {
                Err(PolicyError::Inner(e))
            }
            Outcome::Handled(Failure::Value(v)) => Ok(v),
        }
    }
}
