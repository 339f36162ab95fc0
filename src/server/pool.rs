//! Bounded worker pool for outbound RPC fan-out.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::{self, Duration};

/// Fixed-size pool of outbound call slots. Each submitted task runs on its
/// own tokio task but only after grabbing one of `size` permits, so at most
/// `size` calls are in flight at any time.
#[derive(Debug)]
pub struct FanoutPool {
    /// Number of permits, i.e., max concurrent tasks.
    size: usize,

    /// Permits semaphore; closed once the pool is drained.
    permits: Arc<Semaphore>,
}

impl FanoutPool {
    /// Creates a new pool with `size` permits.
    pub fn new(size: usize) -> Self {
        FanoutPool {
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Submits a task. Tasks submitted after `drain()` are dropped without
    /// running.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }

    /// Waits up to `timeout` for in-flight tasks to finish, then closes the
    /// pool. Returns true if every task finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.size).unwrap_or(u32::MAX);
        let drained = matches!(
            time::timeout(timeout, self.permits.acquire_many(all)).await,
            Ok(Ok(_))
        );
        self.permits.close();
        if !drained {
            pf_warn!("fan-out pool not drained within {:?}", timeout);
        }
        drained
    }

    /// Number of calls currently in flight.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}
