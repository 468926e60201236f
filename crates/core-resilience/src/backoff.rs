//! Backoff strategies: generators of retry delay durations.
//!
//! A strategy exposes the delay for the current step and, via [`Backoff::next`],
//! the strategy for the following step. `None` from `next` signals "stop
//! retrying". Strategies are immutable; advancing produces a new instance, so
//! a policy holding a strategy can be shared and re-executed freely.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Context handed to a strategy when computing its successor.
#[derive(Debug, Clone, Copy)]
pub struct BackoffContext {
    /// The attempt number about to be scheduled (1 for the first retry).
    pub attempt: u32,
}

/// A single step in a backoff schedule.
pub trait Backoff: Send + Sync {
    /// Delay to wait before the next attempt.
    fn duration(&self) -> Duration;

    /// The strategy for the step after this one, or `None` to stop retrying.
    fn next(&self, ctx: &BackoffContext) -> Option<Arc<dyn Backoff>>;
}

/// Fixed delay, optionally bounded to a preset number of attempts.
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    delay: Duration,
    remaining: Option<u32>,
}

impl ConstantBackoff {
    /// An unbounded constant delay.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            remaining: None,
        }
    }

    /// A constant delay that yields exactly `attempts` durations: the
    /// strategy returns a successor `attempts - 1` times, then stops.
    pub fn with_limit(delay: Duration, attempts: u32) -> Self {
        Self {
            delay,
            remaining: Some(attempts),
        }
    }
}

impl Backoff for ConstantBackoff {
    fn duration(&self) -> Duration {
        self.delay
    }

    fn next(&self, _ctx: &BackoffContext) -> Option<Arc<dyn Backoff>> {
        match self.remaining {
            None => Some(Arc::new(self.clone())),
            Some(n) if n > 1 => Some(Arc::new(Self {
                delay: self.delay,
                remaining: Some(n - 1),
            })),
            Some(_) => None,
        }
    }
}

/// Walks a fixed sequence of delays, stopping after exhaustion.
#[derive(Debug, Clone)]
pub struct IterableBackoff {
    delays: Arc<Vec<Duration>>,
    index: usize,
}

impl IterableBackoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays: Arc::new(delays),
            index: 0,
        }
    }
}

impl Backoff for IterableBackoff {
    fn duration(&self) -> Duration {
        self.delays.get(self.index).copied().unwrap_or(Duration::ZERO)
    }

    fn next(&self, _ctx: &BackoffContext) -> Option<Arc<dyn Backoff>> {
        if self.index + 1 < self.delays.len() {
            Some(Arc::new(Self {
                delays: self.delays.clone(),
                index: self.index + 1,
            }))
        } else {
            None
        }
    }
}

/// Jitter applied to exponential delays. `None` keeps the schedule
/// deterministic, which the test suites rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    None,
    /// Uniform over `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform over `[0, delay / 2]`.
    Half,
}

/// Options for [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct ExponentialOptions {
    /// Delay used as the base of the schedule.
    pub initial: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Growth factor between steps.
    pub exponent: f64,
    /// Total number of durations to yield before stopping, unbounded if `None`.
    pub max_attempts: Option<u32>,
    pub jitter: Jitter,
}

impl Default for ExponentialOptions {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(128),
            max_delay: Duration::from_secs(30),
            exponent: 2.0,
            max_attempts: None,
            jitter: Jitter::Full,
        }
    }
}

/// Exponential backoff: attempt 0 retries immediately, then
/// `min(max_delay, initial * exponent^(n - 1))` with the configured jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    options: ExponentialOptions,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(options: ExponentialOptions) -> Self {
        Self {
            options,
            attempt: 0,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn duration(&self) -> Duration {
        if self.attempt == 0 {
            return Duration::ZERO;
        }
        let base = (self.options.initial.as_millis() as f64
            * self.options.exponent.powi(self.attempt as i32 - 1))
        .min(self.options.max_delay.as_millis() as f64);
        let millis = match self.options.jitter {
            Jitter::None => base,
            Jitter::Full => rand::rng().random_range(0.0..=base),
            Jitter::Half => base / 2.0 + rand::rng().random_range(0.0..=base / 2.0),
        };
        Duration::from_millis(millis as u64)
    }

    fn next(&self, _ctx: &BackoffContext) -> Option<Arc<dyn Backoff>> {
        let attempt = self.attempt + 1;
        if self.options.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(Arc::new(Self {
            options: self.options.clone(),
            attempt,
        }))
    }
}

/// Result of one delegate step: the delay to use and the state to carry into
/// the next invocation of the delegate.
pub struct DelegateStep<S> {
    pub delay: Duration,
    pub state: S,
}

type DelegateFn<S> =
    Arc<dyn Fn(&BackoffContext, Option<&S>) -> Option<DelegateStep<S>> + Send + Sync>;

/// Backoff driven by a caller-supplied function which may carry arbitrary
/// state across steps. Returning `None` from the function stops retrying.
pub struct DelegateBackoff<S> {
    f: DelegateFn<S>,
    current: Duration,
    state: Option<S>,
}

impl<S: Send + Sync + 'static> DelegateBackoff<S> {
    pub fn new(
        f: impl Fn(&BackoffContext, Option<&S>) -> Option<DelegateStep<S>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            f: Arc::new(f),
            current: Duration::ZERO,
            state: None,
        }
    }
}

impl<S: Send + Sync + 'static> Backoff for DelegateBackoff<S> {
    fn duration(&self) -> Duration {
        self.current
    }

    fn next(&self, ctx: &BackoffContext) -> Option<Arc<dyn Backoff>> {
        (self.f)(ctx, self.state.as_ref()).map(|step| {
            Arc::new(Self {
                f: self.f.clone(),
                current: step.delay,
                state: Some(step.state),
            }) as Arc<dyn Backoff>
        })
    }
}

/// Which side of a [`CompositeBackoff`] is authoritative for the delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeBias {
    A,
    B,
}

/// Combines two strategies: the biased side's `duration()` wins, both sides
/// advance on `next()`, and the schedule stops as soon as either side stops.
/// This is what lets an attempt bound and a delay schedule be configured in
/// either order without one silently overriding the other.
pub struct CompositeBackoff {
    bias: CompositeBias,
    a: Arc<dyn Backoff>,
    b: Arc<dyn Backoff>,
}

impl CompositeBackoff {
    pub fn new(bias: CompositeBias, a: Arc<dyn Backoff>, b: Arc<dyn Backoff>) -> Self {
        Self { bias, a, b }
    }
}

impl Backoff for CompositeBackoff {
    fn duration(&self) -> Duration {
        match self.bias {
            CompositeBias::A => self.a.duration(),
            CompositeBias::B => self.b.duration(),
        }
    }

    fn next(&self, ctx: &BackoffContext) -> Option<Arc<dyn Backoff>> {
        let a = self.a.next(ctx)?;
        let b = self.b.next(ctx)?;
        Some(Arc::new(Self {
            bias: self.bias,
            a,
            b,
        }))
    }
}
