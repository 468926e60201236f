//! Retry policy.
//!
//! Loops invoking the wrapped function, consulting a backoff schedule between
//! attempts and honoring cooperative cancellation. The `on_retry` event is
//! emitted *before* the delay is awaited — an explicit ordering contract so
//! tests driving a simulated clock can observe the scheduled delay first.

use crate::backoff::{Backoff, BackoffContext, CompositeBackoff, CompositeBias, ConstantBackoff,
    DelegateBackoff, DelegateStep, ExponentialBackoff, ExponentialOptions, IterableBackoff};
use crate::events::EventEmitter;
use crate::executor::{ExecutionContext, Executor, Failure, Outcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Emitted on `on_retry` before each backoff delay is awaited.
#[derive(Debug, Clone)]
pub struct RetryEvent<E> {
    /// The attempt that just failed (0 = the initial call).
    pub attempt: u32,
    /// The delay about to be awaited.
    pub delay: Duration,
    /// The failure reason; `None` for value-classified failures.
    pub error: Option<E>,
}

/// Emitted on `on_give_up` when no backoff remains or cancellation fired.
#[derive(Debug, Clone)]
pub struct GiveUpEvent<E> {
    pub error: Option<E>,
}

/// See the module docs.
///
/// Retry policies are immutable value-like builders: every configuration
/// method returns a new, independently configured instance whose events
/// forward to the instance it was derived from.
pub struct RetryPolicy<E> {
    executor: Executor<E>,
    backoff: Option<Arc<dyn Backoff>>,
    on_retry: EventEmitter<RetryEvent<E>>,
    on_give_up: EventEmitter<GiveUpEvent<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            backoff: self.backoff.clone(),
            on_retry: self.on_retry.clone(),
            on_give_up: self.on_give_up.clone(),
        }
    }
}

impl<E: Clone + 'static> RetryPolicy<E> {
    pub(crate) fn new(executor: Executor<E>) -> Self {
        Self {
            executor,
            backoff: None,
            on_retry: EventEmitter::new(),
            on_give_up: EventEmitter::new(),
        }
    }

    /// Sets the number of retry attempts to make.
    pub fn attempts(&self, count: u32) -> Self {
        self.compose(
            CompositeBias::A,
            Arc::new(ConstantBackoff::with_limit(Duration::from_millis(1), count)),
        )
    }

    /// Sets a fixed delay between retries.
    pub fn delay(&self, delay: Duration) -> Self {
        self.compose(CompositeBias::B, Arc::new(ConstantBackoff::new(delay)))
    }

    /// Sets a list of delays; the list also bounds the number of retries.
    pub fn delay_sequence(&self, delays: Vec<Duration>) -> Self {
        self.compose(CompositeBias::B, Arc::new(IterableBackoff::new(delays)))
    }

    /// Uses an exponential backoff for retries.
    pub fn exponential(&self, options: ExponentialOptions) -> Self {
        self.compose(CompositeBias::B, Arc::new(ExponentialBackoff::new(options)))
    }

    /// Uses a caller-supplied delegate to compute delays, carrying state
    /// between steps.
    pub fn delegate<S: Send + Sync + 'static>(
        &self,
        f: impl Fn(&BackoffContext, Option<&S>) -> Option<DelegateStep<S>> + Send + Sync + 'static,
    ) -> Self {
        self.compose(CompositeBias::B, Arc::new(DelegateBackoff::new(f)))
    }

    /// Uses a custom backoff strategy for retries.
    pub fn backoff(&self, backoff: Arc<dyn Backoff>) -> Self {
        self.compose(CompositeBias::B, backoff)
    }

    /// Fires before each backoff delay with the failure and scheduled delay.
    pub fn on_retry(&self) -> &EventEmitter<RetryEvent<E>> {
        &self.on_retry
    }

    /// Fires when the policy stops retrying and propagates the failure.
    pub fn on_give_up(&self) -> &EventEmitter<GiveUpEvent<E>> {
        &self.on_give_up
    }

    /// Fires after each successful attempt.
    pub fn on_success(&self) -> &EventEmitter<crate::executor::SuccessEvent> {
        self.executor.on_success()
    }

    /// Fires after each failed attempt, including ones that will be retried.
    pub fn on_failure(&self) -> &EventEmitter<crate::executor::FailureEvent<E>> {
        self.executor.on_failure()
    }

    /// Executes the function with retries. The token stops *future* retries
    /// and backoff waits; work already in flight is never aborted.
    pub async fn execute<T, F, Fut>(&self, f: F, cancellation: CancellationToken) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_inner(f, None, cancellation).await
    }

    /// As [`Self::execute`], additionally retrying when the returned value
    /// matches `result_filter`. If retries are exhausted the last value is
    /// returned.
    pub async fn execute_filtered<T, F, Fut>(
        &self,
        f: F,
        result_filter: impl Fn(&T) -> bool + Send + Sync,
        cancellation: CancellationToken,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_inner(f, Some(&result_filter), cancellation)
            .await
    }

    async fn execute_inner<T, F, Fut>(
        &self,
        mut f: F,
        result_filter: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
        cancellation: CancellationToken,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // An unconfigured retry makes a single immediate retry.
        let mut backoff: Option<Arc<dyn Backoff>> = Some(
            self.backoff
                .clone()
                .unwrap_or_else(|| Arc::new(ConstantBackoff::with_limit(Duration::ZERO, 1))),
        );
        let mut attempt: u32 = 0;

        loop {
            let ctx = ExecutionContext {
                attempt,
                cancellation: cancellation.clone(),
            };
            let outcome = self.executor.invoke(|| f(), &ctx, result_filter).await;

            let failure = match outcome {
                Outcome::Success(value) => return Ok(value),
                Outcome::Unhandled(error) => return Err(error),
                Outcome::Handled(failure) => failure,
            };

            match backoff.take() {
                Some(strategy) if !cancellation.is_cancelled() => {
                    let delay = strategy.duration();
                    self.on_retry.emit(&RetryEvent {
                        attempt,
                        delay,
                        error: failure.error(),
                    });

                    let cancelled = tokio::select! {
                        _ = cancellation.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        return self.give_up(failure);
                    }

                    attempt += 1;
                    backoff = strategy.next(&BackoffContext { attempt });
                }
                _ => return self.give_up(failure),
            }
        }
    }

    fn give_up<T>(&self, failure: Failure<T, E>) -> Result<T, E> {
        self.on_give_up.emit(&GiveUpEvent {
            error: failure.error(),
        });
        match failure {
            Failure::Error(e) => Err(e),
            Failure::Value(v) => Ok(v),
        }
    }

    fn compose(&self, bias: CompositeBias, new: Arc<dyn Backoff>) -> Self {
        let backoff = match &self.backoff {
            Some(existing) => {
                Arc::new(CompositeBackoff::new(bias, existing.clone(), new)) as Arc<dyn Backoff>
            }
            None => new,
        };
        Self {
            executor: self.executor.derive(),
            backoff: Some(backoff),
            on_retry: self.on_retry.clone(),
            on_give_up: self.on_give_up.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct TestError;

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    #[tokio::test]
    async fn test_returns_first_success() {
        let p = Policy::handle_all::<TestError>().retry().attempts(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let result = p
            .execute(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, TestError>(42)
                    }
                },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_sequence_invokes_and_records_in_order() {
        let p = Policy::handle_all::<TestError>().retry().delay_sequence(vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(20),
        ]);

        let delays = Arc::new(Mutex::new(Vec::new()));
        let d = delays.clone();
        let _sub = p.on_retry().subscribe(move |ev| {
            d.lock().push(ev.delay.as_millis() as u64);
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result = p
            .execute(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TestError)
                    }
                },
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*delays.lock(), vec![10, 20, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_and_delay_compose_in_either_order() {
        for p in [
            Policy::handle_all::<TestError>()
                .retry()
                .attempts(2)
                .delay(Duration::from_millis(500)),
            Policy::handle_all::<TestError>()
                .retry()
                .delay(Duration::from_millis(500))
                .attempts(2),
        ] {
            let delays = Arc::new(Mutex::new(Vec::new()));
            let d = delays.clone();
            let _sub = p.on_retry().subscribe(move |ev| {
                d.lock().push(ev.delay.as_millis() as u64);
            });

            let calls = Arc::new(AtomicUsize::new(0));
            let c = calls.clone();
            let _ = p
                .execute(
                    move || {
                        let c = c.clone();
                        async move {
                            c.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(TestError)
                        }
                    },
                    CancellationToken::new(),
                )
                .await;

            assert_eq!(calls.load(Ordering::SeqCst), 3);
            assert_eq!(*delays.lock(), vec![500, 500]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_further_retries() {
        let p = Policy::handle_all::<TestError>()
            .retry()
            .attempts(10)
            .delay(Duration::from_millis(50));
        let token = CancellationToken::new();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let t = token.clone();
        let result = p
            .execute(
                move || {
                    let c = c.clone();
                    let t = t.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) == 1 {
                            // Cancel during the second invocation.
                            t.cancel();
                        }
                        Err::<(), _>(TestError)
                    }
                },
                token.clone(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_and_propagates_original_error() {
        let p = Policy::handle_all::<TestError>().retry().attempts(1);
        let give_ups = Arc::new(AtomicUsize::new(0));
        let g = give_ups.clone();
        let _sub = p.on_give_up().subscribe(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });

        let result = p
            .execute(|| async { Err::<(), _>(TestError) }, CancellationToken::new())
            .await;
        assert_eq!(result.unwrap_err(), TestError);
        assert_eq!(give_ups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_on_filtered_values() {
        let p = Policy::handle_all::<TestError>().retry().attempts(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let result = p
            .execute_filtered(
                move || {
                    let c = c.clone();
                    async move { Ok::<_, TestError>(c.fetch_add(1, Ordering::SeqCst) as i32) }
                },
                |v| *v < 2,
                CancellationToken::new(),
            )
            .await;

        // Values 0 and 1 were retried; 2 passed the filter.
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_derived_policy_forwards_retry_events() {
        let base = Policy::handle_all::<TestError>().retry();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let _sub = base.on_retry().subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let derived = base.attempts(2);
        let _ = derived
            .execute(|| async { Err::<(), _>(TestError) }, CancellationToken::new())
            .await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unhandled_error_is_not_retried() {
        let p = Policy::handle_when(|e: &TestError| *e != TestError)
            .retry()
            .attempts(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let result = p
            .execute(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TestError)
                    }
                },
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
