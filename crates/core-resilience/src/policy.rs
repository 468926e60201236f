//! Policy construction entry point.
//!
//! A policy chain starts by declaring what counts as a handled failure, then
//! picks a concrete policy kind:
//!
//! ```no_run
//! use tether_core_resilience::{Policy, ConsecutiveBreaker};
//! use std::time::Duration;
//!
//! # #[derive(Debug, Clone)] struct MyError { transient: bool }
//! let retry = Policy::handle_when(|e: &MyError| e.transient)
//!     .retry()
//!     .attempts(3)
//!     .delay(Duration::from_millis(100));
//!
//! let breaker = Policy::handle_when(|e: &MyError| e.transient)
//!     .circuit_breaker(Duration::from_secs(5), ConsecutiveBreaker::new(3));
//! ```

use crate::breaker::BreakerStrategy;
use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::executor::Executor;
use crate::fallback::FallbackPolicy;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;
use std::time::Duration;

/// Namespace for policy constructors.
pub struct Policy;

impl Policy {
    /// Treats every error as a handled failure.
    pub fn handle_all<E: 'static>() -> PolicyBuilder<E> {
        PolicyBuilder {
            executor: Executor::handle_all(),
        }
    }

    /// Treats errors matching the predicate as handled failures; all other
    /// errors bypass the policy and propagate to the caller untouched.
    pub fn handle_when<E: 'static>(
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> PolicyBuilder<E> {
        PolicyBuilder {
            executor: Executor::handle_when(predicate),
        }
    }
}

/// Intermediate builder produced by [`Policy`]; picks the policy kind.
pub struct PolicyBuilder<E> {
    executor: Executor<E>,
}

impl<E: Clone + 'static> PolicyBuilder<E> {
    /// A retry policy; configure its backoff with the builder methods on
    /// [`RetryPolicy`].
    pub fn retry(self) -> RetryPolicy<E> {
        RetryPolicy::new(self.executor)
    }

    /// A circuit breaker that opens when `strategy` says so and probes
    /// recovery `half_open_after` later.
    pub fn circuit_breaker(
        self,
        half_open_after: Duration,
        strategy: impl BreakerStrategy + 'static,
    ) -> CircuitBreakerPolicy<E> {
        CircuitBreakerPolicy::new(self.executor, half_open_after, strategy)
    }

    /// A bulkhead bounding concurrent executions to `capacity`, with up to
    /// `queue` callers waiting behind them.
    pub fn bulkhead(self, capacity: usize, queue: usize) -> BulkheadPolicy<E> {
        BulkheadPolicy::new(self.executor, capacity, queue)
    }

    /// A timeout racing the call against a cancellation-linked timer.
    pub fn timeout(self, duration: Duration) -> TimeoutPolicy<E>
    where
        E: Send,
    {
        TimeoutPolicy::new(self.executor, duration)
    }

    /// A fallback substituting a value when a handled failure occurs.
    pub fn fallback(self) -> FallbackPolicy<E> {
        FallbackPolicy::new(self.executor)
    }
}
