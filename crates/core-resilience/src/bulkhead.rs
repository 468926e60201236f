//! Bulkhead policy: bounds concurrent executions and the queue behind them.

use crate::errors::PolicyError;
use crate::executor::{ExecutionContext, Executor, Failure, Outcome};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Allows up to `capacity` concurrent executions, with up to `queue` callers
/// waiting for a slot. Anything beyond that is rejected immediately with
/// [`PolicyError::BulkheadRejected`], without invoking the function.
pub struct BulkheadPolicy<E> {
    executor: Executor<E>,
    slots: Arc<Semaphore>,
    admission: Arc<Semaphore>,
}

impl<E> Clone for BulkheadPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            slots: self.slots.clone(),
            admission: self.admission.clone(),
        }
    }
}

impl<E: Clone + 'static> BulkheadPolicy<E> {
    pub(crate) fn new(executor: Executor<E>, capacity: usize, queue: usize) -> Self {
        Self {
            executor,
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            admission: Arc::new(Semaphore::new(capacity.max(1) + queue)),
        }
    }

    /// Number of executions that may start immediately.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn execute<T, F, Fut>(
        &self,
        f: F,
        cancellation: CancellationToken,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Ok(_admitted) = self.admission.try_acquire() else {
            return Err(PolicyError::BulkheadRejected);
        };

        let _slot = tokio::select! {
            permit = self.slots.acquire() => {
                permit.map_err(|_| PolicyError::BulkheadRejected)?
            }
            _ = cancellation.cancelled() => return Err(PolicyError::TaskCancelled),
        };

        let ctx = ExecutionContext::new(cancellation);
        match self.executor.invoke(f, &ctx, None).await {
            Outcome::Success(value) => Ok(value),
            Outcome::Handled(Failure::Error(e)) | Outcome::Unhandled(e) => {
                Err(PolicyError::Inner(e))
            }
            Outcome::Handled(Failure::Value(v)) => Ok(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct TestError;

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_beyond_capacity_and_queue() {
        let p = Policy::handle_all::<TestError>().bulkhead(1, 1);

        let slow = |ms: u64| {
            let p = p.clone();
            async move {
                p.execute(
                    || async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok::<_, TestError>(())
                    },
                    CancellationToken::new(),
                )
                .await
            }
        };

        let a = tokio::spawn(slow(50));
        let b = tokio::spawn(slow(50));
        tokio::task::yield_now().await;

        // Capacity (1) and queue (1) are taken; the third call is rejected.
        let c = p
            .execute(|| async { Ok::<_, TestError>(()) }, CancellationToken::new())
            .await;
        assert!(matches!(c, Err(PolicyError::BulkheadRejected)));

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_executes_within_capacity() {
        let p = Policy::handle_all::<TestError>().bulkhead(2, 0);
        let v = p
            .execute(|| async { Ok::<_, TestError>(7) }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v, 7);
    }
}
