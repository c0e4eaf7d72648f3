//! Media worker pool
//!
//! A fixed set of workers spawned at startup. Routers are placed on a worker
//! chosen uniformly at random; there is no affinity and no rebalancing. The
//! pool is read-only after construction, so selection needs no locking.
//!
//! A worker dying is unrecoverable for every router it hosted. The pool does
//! not try to replace it: [`WorkerPool::wait_for_worker_death`] lets the
//! process owner exit so a supervisor can restart it.

use futures::future::{select_all, BoxFuture};
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::{EngineResult, MediaEngine, MediaRouter, MediaWorker, WorkerSettings};
use crate::error::EngineError;

/// Which worker died and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub worker_id: String,
    pub reason: String,
}

pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
}

impl WorkerPool {
    /// Spawn `size` workers on the engine
    pub async fn start(
        engine: &dyn MediaEngine,
        size: usize,
        settings: &WorkerSettings,
    ) -> EngineResult<Self> {
        if size == 0 {
            return Err(EngineError::Other("worker pool size must be at least 1".to_string()));
        }

        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let worker = engine.create_worker(settings).await?;
            debug!(worker_id = %worker.id(), "Media worker spawned");
            workers.push(worker);
        }

        info!(
            workers = workers.len(),
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "Worker pool started"
        );

        Ok(Self { workers })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Pick a worker uniformly at random
    #[must_use]
    pub fn pick(&self) -> Option<Arc<dyn MediaWorker>> {
        self.workers.choose(&mut rand::rng()).cloned()
    }

    /// Allocate a router on a randomly chosen worker
    pub async fn create_router(&self) -> EngineResult<Arc<dyn MediaRouter>> {
        let worker = self
            .pick()
            .ok_or_else(|| EngineError::Other("worker pool is empty".to_string()))?;
        let router = worker.create_router().await?;
        debug!(worker_id = %worker.id(), router_id = %router.id(), "Router allocated");
        Ok(router)
    }

    /// Resolves as soon as any worker dies
    pub async fn wait_for_worker_death(&self) -> WorkerDeath {
        let watchers: Vec<BoxFuture<'static, WorkerDeath>> = self
            .workers
            .iter()
            .map(|worker| {
                let worker = Arc::clone(worker);
                let fut: BoxFuture<'static, WorkerDeath> = Box::pin(async move {
                    let reason = worker.died().await;
                    WorkerDeath {
                        worker_id: worker.id().to_string(),
                        reason,
                    }
                });
                fut
            })
            .collect();

        if watchers.is_empty() {
            return std::future::pending().await;
        }

        let (death, _, _) = select_all(watchers).await;
        death
    }

    /// Close every worker (and with them every router)
    pub async fn close(&self) {
        for worker in &self.workers {
            worker.close().await;
        }
        info!("Worker pool closed");
    }
}
