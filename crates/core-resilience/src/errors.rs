//! Errors synthesized by the policy layer itself.
//!
//! These signal "the call was never attempted" or "gave up by design" rather
//! than a failure of the wrapped operation; the wrapped operation's own error
//! type is carried through the `Inner` variant.

use std::time::Duration;
use thiserror::Error;

/// Error returned from policy execution.
#[derive(Debug, Error)]
pub enum PolicyError<E> {
    /// The circuit breaker is open; the wrapped function was not invoked.
    #[error("execution prevented because the circuit breaker is open")]
    BrokenCircuit,

    /// The circuit breaker was manually isolated; the wrapped function was
    /// not invoked.
    #[error("execution prevented because the circuit breaker is isolated")]
    IsolatedCircuit,

    /// The caller's cancellation token fired before the call was attempted.
    #[error("the operation was cancelled")]
    TaskCancelled,

    /// The bulkhead's capacity and queue are both exhausted.
    #[error("execution rejected because the bulkhead queue is full")]
    BulkheadRejected,

    /// The call did not complete within the timeout policy's duration.
    #[error("the operation timed out after {0:?}")]
    Timeout(Duration),

    /// The wrapped operation's own error.
    #[error("{0}")]
    Inner(E),
}

impl<E> PolicyError<E> {
    /// Returns the wrapped operation's error, if that is what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            PolicyError::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the call was rejected by an open (not isolated) circuit.
    pub fn is_broken_circuit(&self) -> bool {
        matches!(self, PolicyError::BrokenCircuit)
    }

    /// Maps the inner error type, leaving policy-synthesized variants alone.
    pub fn map_inner<F, T>(self, f: F) -> PolicyError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            PolicyError::Inner(e) => PolicyError::Inner(f(e)),
            PolicyError::BrokenCircuit => PolicyError::BrokenCircuit,
            PolicyError::IsolatedCircuit => PolicyError::IsolatedCircuit,
            PolicyError::TaskCancelled => PolicyError::TaskCancelled,
            PolicyError::BulkheadRejected => PolicyError::BulkheadRejected,
            PolicyError::Timeout(d) => PolicyError::Timeout(d),
        }
    }
}
