//! Circuit breaker policy.
//!
//! Tracks Closed/Open/HalfOpen/Isolated states per policy instance, driven by
//! a pluggable [`BreakerStrategy`]. While the circuit is open the wrapped
//! function is never invoked; after the configured cooldown the next call
//! becomes the single half-open probe, and concurrent callers wait on that
//! probe's outcome instead of issuing their own calls.

use crate::breaker::BreakerStrategy;
use crate::errors::PolicyError;
use crate::events::EventEmitter;
use crate::executor::{ExecutionContext, Executor, Failure, Outcome};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Publicly observable state of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; requests pass through.
    Closed,
    /// Failing fast; requests are rejected without invoking the function.
    Open,
    /// Testing recovery with a single probe call.
    HalfOpen,
    /// Manually isolated via [`CircuitBreakerPolicy::isolate`].
    Isolated,
}

/// The most recent handled failure, kept for introspection.
#[derive(Debug, Clone)]
pub struct LastFailure<E> {
    pub error: E,
    pub at: std::time::SystemTime,
}

/// Emitted on `on_break` when the circuit opens (or is isolated).
#[derive(Debug, Clone)]
pub struct BreakEvent<E> {
    /// True when the break was a manual isolation rather than a failure.
    pub isolated: bool,
    /// The triggering error, absent for isolation and value-classified
    /// failures.
    pub error: Option<E>,
}

enum InnerState {
    Closed,
    Open { next_probe: Instant },
    HalfOpen { probe: watch::Receiver<Option<bool>> },
}

struct Inner<E> {
    state: InnerState,
    strategy: Box<dyn BreakerStrategy>,
    isolation_handles: u32,
    last_failure: Option<LastFailure<E>>,
}

impl<E> Inner<E> {
    fn public_state(&self) -> CircuitState {
        if self.isolation_handles > 0 {
            return CircuitState::Isolated;
        }
        match self.state {
            InnerState::Closed => CircuitState::Closed,
            InnerState::Open { .. } => CircuitState::Open,
            InnerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// See the module docs.
///
/// Cloning shares the same circuit: all clones observe and drive one state
/// machine, and their event emitters are shared.
pub struct CircuitBreakerPolicy<E> {
    executor: Executor<E>,
    half_open_after: Duration,
    inner: Arc<Mutex<Inner<E>>>,
    on_break: EventEmitter<BreakEvent<E>>,
    on_reset: EventEmitter<()>,
    on_half_open: EventEmitter<()>,
}

impl<E> Clone for CircuitBreakerPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            half_open_after: self.half_open_after,
            inner: self.inner.clone(),
            on_break: self.on_break.clone(),
            on_reset: self.on_reset.clone(),
            on_half_open: self.on_half_open.clone(),
        }
    }
}

enum Action {
    RejectIsolated,
    RejectOpen,
    Call(Option<watch::Sender<Option<bool>>>),
    Wait(watch::Receiver<Option<bool>>),
}

enum ProbeWait {
    Success,
    Failure,
    Cancelled,
    Abandoned,
}

impl<E: Clone + 'static> CircuitBreakerPolicy<E> {
    pub(crate) fn new(
        executor: Executor<E>,
        half_open_after: Duration,
        strategy: impl BreakerStrategy + 'static,
    ) -> Self {
        Self {
            executor,
            half_open_after,
            inner: Arc::new(Mutex::new(Inner {
                state: InnerState::Closed,
                strategy: Box::new(strategy),
                isolation_handles: 0,
                last_failure: None,
            })),
            on_break: EventEmitter::new(),
            on_reset: EventEmitter::new(),
            on_half_open: EventEmitter::new(),
        }
    }

    /// Current state of the circuit.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().public_state()
    }

    /// The most recent handled failure, with its timestamp.
    pub fn last_failure(&self) -> Option<LastFailure<E>> {
        self.inner.lock().last_failure.clone()
    }

    /// Fires when the circuit opens, with the triggering error.
    pub fn on_break(&self) -> &EventEmitter<BreakEvent<E>> {
        &self.on_break
    }

    /// Fires when the circuit closes again.
    pub fn on_reset(&self) -> &EventEmitter<()> {
        &self.on_reset
    }

    /// Fires when a half-open probe is dispatched.
    pub fn on_half_open(&self) -> &EventEmitter<()> {
        &self.on_half_open
    }

    /// Fires after each successful attempt.
    pub fn on_success(&self) -> &EventEmitter<crate::executor::SuccessEvent> {
        self.executor.on_success()
    }

    /// Fires after each failed attempt.
    pub fn on_failure(&self) -> &EventEmitter<crate::executor::FailureEvent<E>> {
        self.executor.on_failure()
    }

    /// Manually isolates the circuit. The circuit remains isolated until
    /// every handle returned from this method has been dropped or disposed,
    /// at which point the breaker strategy is reset and the circuit closes.
    pub fn isolate(&self) -> IsolationHandle<E> {
        let first = {
            let mut inner = self.inner.lock();
            inner.isolation_handles += 1;
            inner.isolation_handles == 1
        };
        if first {
            debug!("circuit breaker isolated");
            self.on_break.emit(&BreakEvent {
                isolated: true,
                error: None,
            });
        }
        IsolationHandle {
            inner: self.inner.clone(),
            on_reset: self.on_reset.clone(),
            released: false,
        }
    }

    /// Feeds an externally observed failure into the breaker strategy, as if
    /// a call had failed. Used for failures surfaced outside `execute`, e.g.
    /// on long-lived streams. Only counts while the circuit is closed.
    pub fn record_synthetic_failure(&self, error: E) {
        if !self.executor.is_handled(&error) {
            return;
        }
        let opened = {
            let mut inner = self.inner.lock();
            inner.last_failure = Some(LastFailure {
                error: error.clone(),
                at: std::time::SystemTime::now(),
            });
            match inner.state {
                InnerState::Closed if inner.isolation_handles == 0 => {
                    if inner.strategy.failure(CircuitState::Closed) {
                        inner.state = InnerState::Open {
                            next_probe: Instant::now() + self.half_open_after,
                        };
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if opened {
            debug!("circuit breaker opened by synthetic failure");
            self.on_break.emit(&BreakEvent {
                isolated: false,
                error: Some(error),
            });
        }
    }

    /// Executes the wrapped function under the circuit's protection.
    ///
    /// In Open or Isolated state this short-circuits without invoking the
    /// function. During a half-open probe, the call waits for the probe's
    /// outcome: a failed probe rejects every waiter with `BrokenCircuit`
    /// without further invocations; a successful probe closes the circuit
    /// and lets the waiter proceed. A waiter whose own cancellation token
    /// fires first receives `TaskCancelled`.
    pub async fn execute<T, F, Fut>(
        &self,
        f: F,
        cancellation: CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_inner(f, None, cancellation).await
    }

    /// As [`Self::execute`], additionally treating returned values matching
    /// `result_filter` as handled failures.
    pub async fn execute_filtered<T, F, Fut>(
        &self,
        f: F,
        result_filter: impl Fn(&T) -> bool + Send + Sync,
        cancellation: CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_inner(f, Some(&result_filter), cancellation)
            .await
    }

    async fn execute_inner<T, F, Fut>(
        &self,
        f: F,
        result_filter: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
        cancellation: CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            let action = {
                let mut inner = self.inner.lock();
                if inner.isolation_handles > 0 {
                    Action::RejectIsolated
                } else {
                    match &inner.state {
                        InnerState::Closed => Action::Call(None),
                        InnerState::Open { next_probe } => {
                            if Instant::now() >= *next_probe {
                                let (tx, rx) = watch::channel(None);
                                inner.state = InnerState::HalfOpen { probe: rx };
                                Action::Call(Some(tx))
                            } else {
                                Action::RejectOpen
                            }
                        }
                        InnerState::HalfOpen { probe } => Action::Wait(probe.clone()),
                    }
                }
            };

            match action {
                Action::RejectIsolated => return Err(PolicyError::IsolatedCircuit),
                Action::RejectOpen => return Err(PolicyError::BrokenCircuit),
                Action::Call(probe) => {
                    if probe.is_some() {
                        debug!("circuit breaker dispatching half-open probe");
                        self.on_half_open.emit(&());
                    }
                    return self.run_call(f, result_filter, probe, cancellation).await;
                }
                Action::Wait(rx) => match self.wait_for_probe(rx, &cancellation).await {
                    // The probe closed the circuit; re-enter the state
                    // machine and make our own call.
                    ProbeWait::Success => continue,
                    ProbeWait::Failure => return Err(PolicyError::BrokenCircuit),
                    ProbeWait::Cancelled => return Err(PolicyError::TaskCancelled),
                    ProbeWait::Abandoned => {
                        let mut inner = self.inner.lock();
                        if let InnerState::HalfOpen { probe } = &inner.state {
                            if probe.has_changed().is_err() {
                                // Prober was dropped without an outcome;
                                // allow an immediate re-probe.
                                inner.state = InnerState::Open {
                                    next_probe: Instant::now(),
                                };
                            }
                        }
                        continue;
                    }
                },
            }
        }
    }

    async fn wait_for_probe(
        &self,
        mut rx: watch::Receiver<Option<bool>>,
        cancellation: &CancellationToken,
    ) -> ProbeWait {
        loop {
            if let Some(success) = *rx.borrow_and_update() {
                return if success {
                    ProbeWait::Success
                } else {
                    ProbeWait::Failure
                };
            }
            tokio::select! {
                _ = cancellation.cancelled() => return ProbeWait::Cancelled,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return ProbeWait::Abandoned;
                    }
                }
            }
        }
    }

    async fn run_call<T, F, Fut>(
        &self,
        f: F,
        result_filter: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
        probe: Option<watch::Sender<Option<bool>>>,
        cancellation: CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let from_half_open = probe.is_some();
        let ctx = ExecutionContext::new(cancellation);
        let outcome = self.executor.invoke(f, &ctx, result_filter).await;

        match outcome {
            Outcome::Success(value) => {
                self.handle_success(from_half_open);
                if let Some(tx) = probe {
                    let _ = tx.send(Some(true));
                }
                Ok(value)
            }
            Outcome::Handled(failure) => {
                self.handle_failure(failure.error(), from_half_open);
                if let Some(tx) = probe {
                    let _ = tx.send(Some(false));
                }
                match failure {
                    Failure::Error(e) => Err(PolicyError::Inner(e)),
                    Failure::Value(v) => Ok(v),
                }
            }
            Outcome::Unhandled(e) => {
                // Unhandled errors bypass the strategy, but a probe that
                // failed for any reason has not proven recovery.
                if from_half_open {
                    self.handle_failure(None, true);
                }
                if let Some(tx) = probe {
                    let _ = tx.send(Some(false));
                }
                Err(PolicyError::Inner(e))
            }
        }
    }

    fn handle_success(&self, from_half_open: bool) {
        let reset = {
            let mut inner = self.inner.lock();
            let state = inner.public_state();
            inner.strategy.success(if from_half_open {
                CircuitState::HalfOpen
            } else {
                state
            });
            if from_half_open {
                inner.state = InnerState::Closed;
                true
            } else {
                false
            }
        };
        if reset {
            debug!("circuit breaker closed after successful half-open probe");
            self.on_reset.emit(&());
        }
    }

    fn handle_failure(&self, error: Option<E>, from_half_open: bool) {
        let break_event = {
            let mut inner = self.inner.lock();
            if let Some(e) = &error {
                inner.last_failure = Some(LastFailure {
                    error: e.clone(),
                    at: std::time::SystemTime::now(),
                });
            }
            if from_half_open {
                let _ = inner.strategy.failure(CircuitState::HalfOpen);
                inner.state = InnerState::Open {
                    next_probe: Instant::now() + self.half_open_after,
                };
                true
            } else {
                match inner.state {
                    InnerState::Closed => {
                        if inner.strategy.failure(CircuitState::Closed) {
                            inner.state = InnerState::Open {
                                next_probe: Instant::now() + self.half_open_after,
                            };
                            true
                        } else {
                            false
                        }
                    }
                    // The circuit moved on while this call was in flight.
                    _ => false,
                }
            }
        };
        if break_event {
            debug!("circuit breaker opened");
            self.on_break.emit(&BreakEvent {
                isolated: false,
                error,
            });
        }
    }
}

/// Reference-counted isolation handle; see [`CircuitBreakerPolicy::isolate`].
pub struct IsolationHandle<E> {
    inner: Arc<Mutex<Inner<E>>>,
    on_reset: EventEmitter<()>,
    released: bool,
}

impl<E> IsolationHandle<E> {
    /// Releases this handle; equivalent to dropping it.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let reset = {
            let mut inner = self.inner.lock();
            inner.isolation_handles -= 1;
            if inner.isolation_handles == 0 {
                inner.strategy.reset();
                inner.state = InnerState::Closed;
                true
            } else {
                false
            }
        };
        if reset {
            self.on_reset.emit(&());
        }
    }
}

impl<E> Drop for IsolationHandle<E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::ConsecutiveBreaker;
    use crate::policy::Policy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct TestError;

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    fn breaker(threshold: u32) -> CircuitBreakerPolicy<TestError> {
        Policy::handle_all::<TestError>()
            .circuit_breaker(Duration::from_secs(1), ConsecutiveBreaker::new(threshold))
    }

    async fn open_breaker(p: &CircuitBreakerPolicy<TestError>, calls: u32) {
        for _ in 0..calls {
            let _ = p
                .execute(|| async { Err::<(), _>(TestError) }, CancellationToken::new())
                .await;
        }
    }

    #[tokio::test]
    async fn test_allows_calls_when_closed() {
        let p = breaker(2);
        let v = p
            .execute(|| async { Ok::<_, TestError>(42) }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures_and_short_circuits() {
        let p = breaker(2);
        let invocations = Arc::new(AtomicUsize::new(0));
        let breaks = Arc::new(AtomicUsize::new(0));
        let b = breaks.clone();
        let _sub = p.on_break().subscribe(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..2 {
            let inv = invocations.clone();
            let result = p
                .execute(
                    || async move {
                        inv.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TestError)
                    },
                    CancellationToken::new(),
                )
                .await;
            assert!(matches!(result, Err(PolicyError::Inner(TestError))));
        }
        assert_eq!(p.state(), CircuitState::Open);
        assert_eq!(breaks.load(Ordering::SeqCst), 1);

        // Rejected without invoking the function.
        let inv = invocations.clone();
        let result = p
            .execute(
                || async move {
                    inv.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), _>(())
                },
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(PolicyError::BrokenCircuit)));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(p.last_failure().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_when_half_open_probe_succeeds() {
        let p = breaker(2);
        let resets = Arc::new(AtomicUsize::new(0));
        let r = resets.clone();
        let _sub = p.on_reset().subscribe(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        open_breaker(&p, 2).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let v = p
            .execute(|| async { Ok::<_, TestError>(42) }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v, 42);
        assert_eq!(p.state(), CircuitState::Closed);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopens_when_half_open_probe_fails() {
        let p = breaker(2);
        open_breaker(&p, 2).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let result = p
            .execute(|| async { Err::<(), _>(TestError) }, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PolicyError::Inner(TestError))));
        assert_eq!(p.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_is_shared_with_one_invocation() {
        let p = breaker(2);
        open_breaker(&p, 2).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let invocations = Arc::new(AtomicUsize::new(0));
        let inv_a = invocations.clone();
        let a = p.execute(
            || async move {
                inv_a.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<(), _>(TestError)
            },
            CancellationToken::new(),
        );
        let inv_b = invocations.clone();
        let b = p.execute(
            || async move {
                inv_b.fetch_add(1, Ordering::SeqCst);
                Ok::<(), _>(())
            },
            CancellationToken::new(),
        );

        let (ra, rb) = tokio::join!(a, b);
        assert!(matches!(ra, Err(PolicyError::Inner(TestError))));
        assert!(matches!(rb, Err(PolicyError::BrokenCircuit)));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(p.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_waiter_runs_after_successful_probe() {
        let p = breaker(2);
        open_breaker(&p, 2).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let probe_returned = Arc::new(AtomicUsize::new(0));
        let pr = probe_returned.clone();
        let a = p.execute(
            || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                pr.store(1, Ordering::SeqCst);
                Ok::<_, TestError>(1)
            },
            CancellationToken::new(),
        );
        let pr = probe_returned.clone();
        let b = p.execute(
            || async move {
                // The waiter must only run once the probe completed.
                assert_eq!(pr.load(Ordering::SeqCst), 1);
                Ok::<_, TestError>(2)
            },
            CancellationToken::new(),
        );

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap(), 1);
        assert_eq!(rb.unwrap(), 2);
        assert_eq!(p.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_waiter_honors_own_cancellation() {
        let p = breaker(2);
        open_breaker(&p, 2).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let token = CancellationToken::new();
        token.cancel();

        let a = p.execute(
            || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, TestError>(1)
            },
            CancellationToken::new(),
        );
        let b = p.execute(|| async { Ok::<_, TestError>(2) }, token);

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap(), 1);
        assert!(matches!(rb, Err(PolicyError::TaskCancelled)));
    }

    #[tokio::test]
    async fn test_isolation_is_reference_counted() {
        let p = breaker(2);
        let resets = Arc::new(AtomicUsize::new(0));
        let r = resets.clone();
        let _sub = p.on_reset().subscribe(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let h1 = p.isolate();
        let h2 = p.isolate();
        assert_eq!(p.state(), CircuitState::Isolated);

        let result = p
            .execute(|| async { Ok::<_, TestError>(42) }, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PolicyError::IsolatedCircuit)));

        h1.dispose();
        assert_eq!(p.state(), CircuitState::Isolated);
        assert_eq!(resets.load(Ordering::SeqCst), 0);

        h2.dispose();
        assert_eq!(p.state(), CircuitState::Closed);
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        let v = p
            .execute(|| async { Ok::<_, TestError>(42) }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn test_unhandled_errors_bypass_the_strategy() {
        let p = Policy::handle_when(|e: &TestError| *e != TestError)
            .circuit_breaker(Duration::from_secs(1), ConsecutiveBreaker::new(1));

        let result = p
            .execute(|| async { Err::<(), _>(TestError) }, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PolicyError::Inner(TestError))));
        assert_eq!(p.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_synthetic_failures_open_the_circuit() {
        let p = breaker(2);
        p.record_synthetic_failure(TestError);
        assert_eq!(p.state(), CircuitState::Closed);
        p.record_synthetic_failure(TestError);
        assert_eq!(p.state(), CircuitState::Open);
    }
}
