//! Fallback policy: substitutes a value when a handled failure occurs.

use crate::executor::{ExecutionContext, Executor, Outcome};
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub struct FallbackPolicy<E> {
    executor: Executor<E>,
}

impl<E> Clone for FallbackPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
        }
    }
}

impl<E: Clone + 'static> FallbackPolicy<E> {
    pub(crate) fn new(executor: Executor<E>) -> Self {
        Self { executor }
    }

    /// Executes the function; on a handled failure the fallback value is
    /// returned instead. Unhandled errors still propagate.
    pub async fn execute<T, F, Fut>(
        &self,
        f: F,
        fallback: impl FnOnce() -> T,
        cancellation: CancellationToken,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ctx = ExecutionContext::new(cancellation);
        match self.executor.invoke(f, &ctx, None).await {
            Outcome::Success(value) => Ok(value),
            Outcome::Handled(_) => Ok(fallback()),
            Outcome::Unhandled(e) => Err(e),
        }
    }
}
