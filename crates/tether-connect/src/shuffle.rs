//! Host iteration order for failover.
//!
//! The order source is constructor-injected rather than a process-wide
//! toggle, so tests get determinism without global state.

use rand::Rng;

/// Supplies swap indices for a fisher-yates pass.
pub trait ShuffleSource: Send + Sync {
    /// Picks an index in `0..=upper`.
    fn pick(&self, upper: usize) -> usize;
}

/// Uniformly random order; the production default.
pub struct RandomShuffle;

impl ShuffleSource for RandomShuffle {
    fn pick(&self, upper: usize) -> usize {
        rand::rng().random_range(0..=upper)
    }
}

/// Keeps hosts in declaration order; for tests.
pub struct InOrderShuffle;

impl ShuffleSource for InOrderShuffle {
    fn pick(&self, upper: usize) -> usize {
        upper
    }
}

/// Endlessly cycles through a host list, reshuffling once per full round.
pub(crate) struct ShuffledCycle<T: Clone> {
    items: Vec<T>,
    index: usize,
    source: std::sync::Arc<dyn ShuffleSource>,
}

impl<T: Clone> ShuffledCycle<T> {
    pub(crate) fn new(items: Vec<T>, source: std::sync::Arc<dyn ShuffleSource>) -> Self {
        let len = items.len();
        Self {
            items,
            index: len, // force a shuffle on the first pick
            source,
        }
    }

    pub(crate) fn next_item(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        if self.index >= self.items.len() {
            for i in (1..self.items.len()).rev() {
                let j = self.source.pick(i);
                self.items.swap(i, j);
            }
            self.index = 0;
        }
        let item = self.items[self.index].clone();
        self.index += 1;
        Some(item)
    }
}
