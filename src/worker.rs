//! Bounded background executor for accepted operations.
//!
//! Jobs are spawned onto the tokio runtime immediately and wait for one of
//! `pool_size` permits before running, so submission never blocks the
//! decision phase. A job runs exactly once; there is no retry and no
//! cancellation. Panics are caught and logged so a faulty collaborator cannot
//! take the pool down.

use crate::core::{BrokerError, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};
use tracing::{Instrument, Span, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorStats {
    /// Submitted jobs that have not finished yet (queued or running).
    pub pending: usize,
    pub started: u64,
    pub completed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct ExecutorState {
    pending: AtomicUsize,
    started: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    closed: AtomicBool,
    idle: Notify,
}

impl ExecutorState {
    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A bounded pool of background jobs.
///
/// ```
/// use osb_broker::worker::BackgroundExecutor;
/// use tracing::Span;
///
/// # tokio_test::block_on(async {
/// let executor = BackgroundExecutor::new(2);
/// executor.submit(Span::none(), async {}).unwrap();
/// executor.wait_idle().await;
/// assert_eq!(executor.stats().completed, 1);
/// # });
/// ```
#[derive(Clone)]
pub struct BackgroundExecutor {
    permits: Arc<Semaphore>,
    state: Arc<ExecutorState>,
    pool_size: usize,
}

impl BackgroundExecutor {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            state: Arc::new(ExecutorState::default()),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Queues `job` to run once inside `span`.
    pub fn submit<F>(&self, span: Span, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Dependency(
                "background executor is shut down".to_string(),
            ));
        }

        self.state.pending.fetch_add(1, Ordering::SeqCst);
        let permits = self.permits.clone();
        let state = self.state.clone();

        tokio::spawn(
            async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        error!(error = %err, "background job dropped: worker pool closed");
                        state.finish();
                        return;
                    }
                };
                state.started.fetch_add(1, Ordering::SeqCst);
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    state.panicked.fetch_add(1, Ordering::SeqCst);
                    error!("background job panicked; its operation stays in progress");
                }
                state.finish();
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Resolves once no submitted job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.state.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Rejects further submissions and drains the jobs already accepted.
    pub async fn shutdown(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            pending: self.state.pending.load(Ordering::SeqCst),
            started: self.state.started.load(Ordering::SeqCst),
            completed: self.state.completed.load(Ordering::SeqCst),
            panicked: self.state.panicked.load(Ordering::SeqCst),
        }
    }
}
