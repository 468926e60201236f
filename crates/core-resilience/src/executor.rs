//! The shared execution wrapper every policy delegates to.
//!
//! The executor owns the failure predicate ("what counts as a handled
//! failure") and the `on_success` / `on_failure` observability emitters.
//! Concrete policies call [`Executor::invoke`] and branch on the returned
//! [`Outcome`]; deriving a child executor shares the parent's emitters, so
//! events raised by inner policies propagate to listeners on the outermost
//! one.

use crate::events::EventEmitter;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Per-attempt execution context threaded through policies.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Zero-based attempt counter (0 for the initial call).
    pub attempt: u32,
    /// Cooperative cancellation for this execution.
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            attempt: 0,
            cancellation,
        }
    }
}

/// Emitted on `on_success` after each successful attempt.
#[derive(Debug, Clone)]
pub struct SuccessEvent {
    pub duration: Duration,
}

/// Emitted on `on_failure` after each failed attempt, whether or not the
/// failure was handled by the policy's predicate. `error` is `None` when the
/// failure is a returned value that matched the result filter.
#[derive(Debug, Clone)]
pub struct FailureEvent<E> {
    pub duration: Duration,
    pub handled: bool,
    pub error: Option<E>,
}

/// A handled failure: either the operation's error, or a returned value that
/// the result filter classified as a failure.
pub enum Failure<T, E> {
    Error(E),
    Value(T),
}

impl<T, E: Clone> Failure<T, E> {
    pub(crate) fn error(&self) -> Option<E> {
        match self {
            Failure::Error(e) => Some(e.clone()),
            Failure::Value(_) => None,
        }
    }
}

/// Classified result of one attempt.
pub(crate) enum Outcome<T, E> {
    Success(T),
    Handled(Failure<T, E>),
    Unhandled(E),
}

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// See the module docs.
pub struct Executor<E> {
    predicate: Predicate<E>,
    on_success: EventEmitter<SuccessEvent>,
    on_failure: EventEmitter<FailureEvent<E>>,
}

impl<E> Clone for Executor<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<E: 'static> Executor<E> {
    /// An executor treating every error as a handled failure.
    pub fn handle_all() -> Self {
        Self::handle_when(|_| true)
    }

    /// An executor treating errors matching `predicate` as handled failures;
    /// everything else bypasses the policy and propagates to the caller.
    pub fn handle_when(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
            on_success: EventEmitter::new(),
            on_failure: EventEmitter::new(),
        }
    }

    /// Derives a child wrapper preserving the predicate and forwarding its
    /// emissions to this executor's emitters.
    pub fn derive(&self) -> Self {
        self.clone()
    }

    pub fn is_handled(&self, error: &E) -> bool {
        (self.predicate)(error)
    }

    /// Fires when an attempt completes successfully.
    pub fn on_success(&self) -> &EventEmitter<SuccessEvent> {
        &self.on_success
    }

    /// Fires when an attempt fails, with the handled classification.
    pub fn on_failure(&self) -> &EventEmitter<FailureEvent<E>> {
        &self.on_failure
    }

    /// Classifies an already-produced result, emitting the observability
    /// events. Used directly by policies that cannot run the call inline
    /// (the timeout policy races a spawned task).
    pub(crate) fn classify<T>(
        &self,
        result: Result<T, E>,
        duration: Duration,
        result_filter: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
    ) -> Outcome<T, E>
    where
        E: Clone,
    {
        match result {
            Ok(value) => {
                if result_filter.is_some_and(|filter| filter(&value)) {
                    self.on_failure.emit(&FailureEvent {
                        duration,
                        handled: true,
                        error: None,
                    });
                    return Outcome::Handled(Failure::Value(value));
                }
                self.on_success.emit(&SuccessEvent { duration });
                Outcome::Success(value)
            }
            Err(error) => {
                let handled = (self.predicate)(&error);
                self.on_failure.emit(&FailureEvent {
                    duration,
                    handled,
                    error: Some(error.clone()),
                });
                if handled {
                    Outcome::Handled(Failure::Error(error))
                } else {
                    Outcome::Unhandled(error)
                }
            }
        }
    }

    /// Invokes the wrapped function once and classifies the result.
    pub(crate) async fn invoke<T, F, Fut>(
        &self,
        f: F,
        _ctx: &ExecutionContext,
        result_filter: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
    ) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Clone,
    {
        let start = Instant::now();
        let result = f().await;
        self.classify(result, start.elapsed(), result_filter)
    }
}
