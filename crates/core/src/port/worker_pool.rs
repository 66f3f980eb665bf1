// Worker Pool Port
// Bounded set of isolated workers that run CallSpecs

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{CallOutcome, CallSpec};

/// Receives the outcome of one submitted call.
///
/// Dropping it abandons the call; the worker may keep running.
pub type PendingCall = oneshot::Receiver<CallOutcome>;

/// Runs one call to completion on the calling (blocking) thread
pub type CallExecutor = Arc<dyn Fn(&CallSpec) -> CallOutcome + Send + Sync>;

/// Worker pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Worker initialization failed: {0}")]
    InitFailed(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(String),
}

/// A pool created for one batch.
///
/// Implementations:
/// - ProcessWorkerPool: one OS process per worker (infra-system)
/// - InProcessPool: blocking tasks in this process (mocks, tests)
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Queue a call; the outcome arrives on the returned receiver
    ///
    /// # Errors
    /// - PoolError::ShutDown if the pool no longer accepts work
    async fn submit(&self, spec: CallSpec) -> Result<PendingCall, PoolError>;

    /// Stop accepting work. Idle workers exit; busy workers are detached, or
    /// killed when `kill_stragglers` is set.
    async fn shutdown(&self, kill_stragglers: bool);

    fn size(&self) -> usize;
}

/// Creates a fresh pool per batch
#[async_trait]
pub trait WorkerPoolFactory: Send + Sync {
    async fn create(&self, size: usize) -> Result<Box<dyn WorkerPool>, PoolError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::constants::PANIC_KIND;
    use crate::domain::CallFailure;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Pool that runs calls on tokio's blocking threads, `size` at a time.
    ///
    /// No process isolation: a panicking call is reported with kind `Panic`,
    /// but an abort takes the test process down.
    pub struct InProcessPool {
        executor: CallExecutor,
        permits: Arc<Semaphore>,
        size: usize,
        closed: AtomicBool,
    }

    impl InProcessPool {
        pub fn new(executor: CallExecutor, size: usize) -> Self {
            let size = size.max(1);
            Self {
                executor,
                permits: Arc::new(Semaphore::new(size)),
                size,
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl WorkerPool for InProcessPool {
        async fn submit(&self, spec: CallSpec) -> Result<PendingCall, PoolError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PoolError::ShutDown);
            }
            let (tx, rx) = oneshot::channel();
            let executor = Arc::clone(&self.executor);
            let permits = Arc::clone(&self.permits);

            tokio::spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let outcome =
                    match tokio::task::spawn_blocking(move || executor(&spec)).await {
                        Ok(outcome) => outcome,
                        Err(join_err) if join_err.is_panic() => {
                            let message = crate::application::panic_guard::panic_message(
                                join_err.into_panic(),
                            );
                            Err(CallFailure::new(PANIC_KIND, message))
                        }
                        Err(join_err) => Err(CallFailure::runtime(join_err.to_string())),
                    };
                // Receiver may be gone after a deadline
                let _ = tx.send(outcome);
            });

            Ok(rx)
        }

        async fn shutdown(&self, _kill_stragglers: bool) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn size(&self) -> usize {
            self.size
        }
    }

    /// Factory for in-process pools; remembers the size of every pool it made
    #[derive(Clone)]
    pub struct InProcessPoolFactory {
        executor: CallExecutor,
        created: Arc<Mutex<Vec<usize>>>,
    }

    impl InProcessPoolFactory {
        pub fn new(executor: CallExecutor) -> Self {
            Self {
                executor,
                created: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn from_fn<F>(f: F) -> Self
        where
            F: Fn(&CallSpec) -> CallOutcome + Send + Sync + 'static,
        {
            Self::new(Arc::new(f))
        }

        pub fn created_sizes(&self) -> Vec<usize> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerPoolFactory for InProcessPoolFactory {
        async fn create(&self, size: usize) -> Result<Box<dyn WorkerPool>, PoolError> {
            self.created.lock().unwrap().push(size);
            Ok(Box::new(InProcessPool::new(Arc::clone(&self.executor), size)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::InProcessPoolFactory;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_process_pool_runs_calls() {
        let factory = InProcessPoolFactory::from_fn(|spec| Ok(json!(spec.function.clone())));
        let pool = factory.create(2).await.unwrap();

        let rx = pool.submit(CallSpec::new("ping")).await.unwrap();
        assert_eq!(rx.await.unwrap(), Ok(json!("ping")));
        assert_eq!(factory.created_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_panic_kind() {
        let factory = InProcessPoolFactory::from_fn(|_| panic!("kaboom"));
        let pool = factory.create(1).await.unwrap();

        let outcome = pool.submit(CallSpec::new("x")).await.unwrap().await.unwrap();
        let failure = outcome.unwrap_err();
        assert_eq!(failure.kind, "Panic");
        assert_eq!(failure.message, "kaboom");
    }

    #[tokio::test]
    async fn test_shut_down_pool_rejects_work() {
        let factory = InProcessPoolFactory::from_fn(|_| Ok(json!(null)));
        let pool = factory.create(1).await.unwrap();
        pool.shutdown(false).await;
        assert!(matches!(
            pool.submit(CallSpec::new("x")).await,
            Err(PoolError::ShutDown)
        ));
    }
}
