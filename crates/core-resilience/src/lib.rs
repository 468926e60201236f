//! Tether Core Resilience: Pure-logic fault tolerance policies
//!
//! # Overview
//!
//! This crate provides composable policies for wrapping asynchronous
//! operations with consistent failure semantics:
//!
//! - **Circuit Breaker**: Fails fast when a dependency is unhealthy, with a
//!   pluggable breaker strategy (consecutive failures or sampled windows)
//! - **Retry**: Re-invokes a failing operation under a configurable backoff
//!   schedule (constant, delay list, exponential with jitter, delegate)
//! - **Bulkhead**: Bounds concurrent executions and the queue behind them
//! - **Timeout**: Races a call against a cancellation-linked timer
//! - **Fallback**: Substitutes a value when a handled failure occurs
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of transports, storage
//! or application concerns. Every policy composes with the same execution
//! wrapper, so a listener attached to the outermost policy observes every
//! attempt made by inner composition.
//!
//! Policies are immutable, value-like builders: every configuration call
//! returns a new policy and never mutates a previously returned one.
//!
//! # Usage Example
//!
//! ```no_run
//! use tether_core_resilience::{Policy, ConsecutiveBreaker};
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # #[derive(Debug, Clone)] struct MyError;
//! # async fn example() -> Result<(), tether_core_resilience::PolicyError<MyError>> {
//! let breaker = Policy::handle_all::<MyError>()
//!     .circuit_breaker(Duration::from_secs(5), ConsecutiveBreaker::new(3));
//!
//! let value = breaker
//!     .execute(|| async { Ok::<_, MyError>(42) }, CancellationToken::new())
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod errors;
pub mod events;
pub mod executor;
pub mod fallback;
pub mod policy;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use backoff::{
    Backoff, BackoffContext, CompositeBackoff, CompositeBias, ConstantBackoff, DelegateBackoff,
    DelegateStep, ExponentialBackoff, ExponentialOptions, IterableBackoff, Jitter,
};
pub use breaker::{BreakerStrategy, ConsecutiveBreaker, SamplingBreaker, SamplingBreakerOptions};
pub use bulkhead::BulkheadPolicy;
pub use circuit_breaker::{BreakEvent, CircuitBreakerPolicy, CircuitState, IsolationHandle, LastFailure};
pub use errors::PolicyError;
pub use events::{Event, EventEmitter, Subscription};
pub use executor::{ExecutionContext, Executor, Failure, FailureEvent, SuccessEvent};
pub use fallback::FallbackPolicy;
pub use policy::{Policy, PolicyBuilder};
pub use retry::{GiveUpEvent, RetryEvent, RetryPolicy};
pub use timeout::TimeoutPolicy;

// Cancellation tokens are first-class values threaded through every execute.
pub use tokio_util::sync::CancellationToken;

/// Returns a cancellation token that is already cancelled. Useful for tests
/// and for callers that want a call rejected before it starts.
pub fn cancelled_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tether_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{Backoff, ConstantBackoff, ExponentialBackoff, IterableBackoff};
    pub use super::breaker::{ConsecutiveBreaker, SamplingBreaker};
    pub use super::circuit_breaker::{CircuitBreakerPolicy, CircuitState};
    pub use super::errors::PolicyError;
    pub use super::policy::Policy;
    pub use super::retry::RetryPolicy;
    pub use tokio_util::sync::CancellationToken;
}
