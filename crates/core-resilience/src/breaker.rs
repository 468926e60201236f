//! Breaker strategies: the pluggable counters behind the circuit breaker.
//!
//! A strategy is consulted with the observed outcome of every handled call
//! and decides when the circuit should open. It never transitions the circuit
//! itself; the policy in [`crate::circuit_breaker`] owns the state machine.

use crate::circuit_breaker::CircuitState;
use std::time::{Duration, Instant};

/// Stateful success/failure counter driving a circuit breaker.
pub trait BreakerStrategy: Send + Sync {
    /// Records a successful call.
    fn success(&mut self, state: CircuitState);

    /// Records a failed call; returns `true` if the circuit should open.
    fn failure(&mut self, state: CircuitState) -> bool;

    /// Clears accumulated counts, used when the circuit is manually reset.
    fn reset(&mut self);
}

/// Opens the circuit after `threshold` consecutive handled failures.
#[derive(Debug, Clone)]
pub struct ConsecutiveBreaker {
    threshold: u32,
    count: u32,
}

impl ConsecutiveBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }
}

impl BreakerStrategy for ConsecutiveBreaker {
    fn success(&mut self, _state: CircuitState) {
        self.count = 0;
    }

    fn failure(&mut self, _state: CircuitState) -> bool {
        self.count += 1;
        self.count >= self.threshold
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Options for [`SamplingBreaker`].
#[derive(Debug, Clone)]
pub struct SamplingBreakerOptions {
    /// Failure ratio in `(0, 1)` above which the circuit opens.
    pub threshold: f64,
    /// Length of the sampling period.
    pub duration: Duration,
    /// Minimum request rate below which the circuit never opens. Defaults so
    /// that at least 5 failures per second are needed to open.
    pub minimum_rps: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    started_at: u64,
    failures: u64,
    successes: u64,
}

/// Opens when more than `threshold` of the calls sampled over the last
/// `duration` failed, provided the observed request rate is above the
/// configured minimum (to avoid flapping under low traffic).
///
/// Samples are kept in at least 5 fixed-size windows rotated lazily as calls
/// arrive; a window that was skipped entirely while the breaker sat idle is
/// reclaimed the next time it rotates in, which keeps the accounting
/// approximate under long idle gaps but exact under normal traffic.
pub struct SamplingBreaker {
    threshold: f64,
    duration_ms: u64,
    window_size_ms: u64,
    minimum_rpms: f64,
    windows: Vec<Window>,
    current_window: usize,
    current_failures: u64,
    current_successes: u64,
    epoch: Instant,
}

impl SamplingBreaker {
    /// # Panics
    ///
    /// Panics if `threshold` is outside `(0, 1)`.
    pub fn new(options: SamplingBreakerOptions) -> Self {
        assert!(
            options.threshold > 0.0 && options.threshold < 1.0,
            "SamplingBreaker threshold must be in (0, 1), got {}",
            options.threshold
        );

        let duration_ms = options.duration.as_millis() as u64;
        // At least 5 windows, each at most 1 second.
        let window_count = 5u64.max(duration_ms.div_ceil(1000));
        let window_size_ms = ((duration_ms as f64) / (window_count as f64)).round() as u64;
        let duration_ms = window_size_ms * window_count;

        let minimum_rpms = match options.minimum_rps {
            Some(rps) => rps / 1000.0,
            None => 5.0 / (options.threshold * 1000.0),
        };

        Self {
            threshold: options.threshold,
            duration_ms,
            window_size_ms,
            minimum_rpms,
            windows: vec![Window::default(); window_count as usize],
            current_window: 0,
            current_failures: 0,
            current_successes: 0,
            epoch: Instant::now(),
        }
    }

    fn reset_windows(&mut self) {
        self.current_failures = 0;
        self.current_successes = 0;
        for window in &mut self.windows {
            *window = Window::default();
        }
    }

    fn rotate_window(&mut self, now: u64) -> usize {
        let next = (self.current_window + 1) % self.windows.len();
        self.current_failures -= self.windows[next].failures;
        self.current_successes -= self.windows[next].successes;
        self.windows[next] = Window {
            started_at: now,
            ..Window::default()
        };
        self.current_window = next;
        next
    }

    fn push(&mut self, success: bool) {
        let now = self.epoch.elapsed().as_millis() as u64;

        let mut index = self.current_window;
        if now - self.windows[index].started_at >= self.window_size_ms {
            index = self.rotate_window(now);
        }

        if success {
            self.windows[index].successes += 1;
            self.current_successes += 1;
        } else {
            self.windows[index].failures += 1;
            self.current_failures += 1;
        }
    }
}

impl BreakerStrategy for SamplingBreaker {
    fn success(&mut self, state: CircuitState) {
        if state == CircuitState::HalfOpen {
            self.reset_windows();
        }
        self.push(true);
    }

    fn failure(&mut self, state: CircuitState) -> bool {
        self.push(false);
        if state != CircuitState::Closed {
            return true;
        }

        let total = self.current_successes + self.current_failures;
        // `total / duration` is the observed request rate; refuse to open
        // until it clears the minimum: total < duration * minimum_rpms.
        if (total as f64) < self.duration_ms as f64 * self.minimum_rpms {
            return false;
        }

        self.current_failures as f64 > self.threshold * total as f64
    }

    fn reset(&mut self) {
        self.reset_windows();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_opens_at_threshold() {
        let mut b = ConsecutiveBreaker::new(3);
        assert!(!b.failure(CircuitState::Closed));
        assert!(!b.failure(CircuitState::Closed));
        assert!(b.failure(CircuitState::Closed));
    }

    #[test]
    fn test_consecutive_success_resets_count() {
        let mut b = ConsecutiveBreaker::new(2);
        assert!(!b.failure(CircuitState::Closed));
        b.success(CircuitState::Closed);
        assert!(!b.failure(CircuitState::Closed));
        assert!(b.failure(CircuitState::Closed));
    }

    #[test]
    fn test_sampling_never_opens_below_minimum_rate() {
        let mut b = SamplingBreaker::new(SamplingBreakerOptions {
            threshold: 0.5,
            duration: Duration::from_secs(5),
            minimum_rps: Some(100.0),
        });

        // 100% failure, but far fewer than duration * minimum_rps samples.
        for _ in 0..20 {
            assert!(!b.failure(CircuitState::Closed));
        }
    }

    #[test]
    fn test_sampling_opens_above_threshold_and_rate() {
        let mut b = SamplingBreaker::new(SamplingBreakerOptions {
            threshold: 0.5,
            duration: Duration::from_secs(5),
            minimum_rps: Some(0.001),
        });

        // duration * minimum_rpms = 5000ms * 0.000001 = 0.005 samples needed,
        // so the rate gate passes immediately; the ratio decides.
        b.success(CircuitState::Closed);
        assert!(!b.failure(CircuitState::Closed));
        assert!(b.failure(CircuitState::Closed));
    }

    #[test]
    fn test_sampling_failure_outside_closed_reopens() {
        let mut b = SamplingBreaker::new(SamplingBreakerOptions {
            threshold: 0.9,
            duration: Duration::from_secs(5),
            minimum_rps: Some(1000.0),
        });
        assert!(b.failure(CircuitState::HalfOpen));
    }

    #[test]
    #[should_panic(expected = "threshold")]
    fn test_sampling_rejects_bad_threshold() {
        SamplingBreaker::new(SamplingBreakerOptions {
            threshold: 1.5,
            duration: Duration::from_secs(5),
            minimum_rps: None,
        });
    }
}
