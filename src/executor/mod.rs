//! Dynamic executor
//!
//! A [`DynamicExecutor`] fronts one live [`pool::ThreadPool`] generation.
//! Thread limits, keep-alive and the rejection policy are changed on the
//! live generation in place. Changing the queue builds a new generation, moves
//! every not-yet-started task into it in FIFO order and swaps it in; workers
//! of the old generation finish what they are running and exit.
//!
//! Sampling only reads atomics and the published parameters, so it never
//! waits on a reconfiguration.

mod builder;
mod pool;
mod task;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExecutorError;
use crate::model::ExecutorParameters;

use pool::{Admission, Counters, ThreadPool};
use task::Job;

pub use builder::ExecutorBuilder;
pub use task::{SpanPropagation, Task, TaskDecorator};

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolSample {
    pub active_count: usize,
    pub pool_size: usize,
    pub largest_pool_size: usize,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_size: usize,
    /// `None` for an unbounded queue
    pub queue_capacity: Option<usize>,
    pub completed_task_count: u64,
    pub reject_count: u64,
}

/// What a call to [`DynamicExecutor::reconfigure`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfiguration {
    Unchanged,
    InPlace,
    /// A new queue was swapped in; `moved` pending tasks were carried over.
    Replaced { moved: usize },
}

struct Inner {
    pool_id: String,
    live: ArcSwap<ThreadPool>,
    parameters: ArcSwap<ExecutorParameters>,
    counters: Arc<Counters>,
    decorator: Option<Arc<dyn TaskDecorator>>,
    reconfigure_lock: Mutex<()>,
    next_task_id: AtomicU64,
    generation: AtomicU64,
    shut_down: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // idle core workers would otherwise wait forever
        self.live.load().shutdown();
    }
}

/// Thread pool whose parameters can change while it runs. Cheap to clone.
#[derive(Clone)]
pub struct DynamicExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DynamicExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicExecutor")
            .field("pool_id", &self.inner.pool_id)
            .field("parameters", &**self.inner.parameters.load())
            .finish_non_exhaustive()
    }
}

impl DynamicExecutor {
    pub(crate) fn new(
        pool_id: String,
        parameters: ExecutorParameters,
        decorator: Option<Arc<dyn TaskDecorator>>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        counters
            .execution_timeout_ms
            .store(parameters.execution_timeout_ms, Ordering::Relaxed);
        let live = ThreadPool::new(&pool_id, 0, &parameters, Arc::clone(&counters));

        Self {
            inner: Arc::new(Inner {
                pool_id,
                live: ArcSwap::from_pointee(live),
                parameters: ArcSwap::from_pointee(parameters),
                counters,
                decorator,
                reconfigure_lock: Mutex::new(()),
                next_task_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.inner.pool_id
    }

    /// Parameters currently in effect
    pub fn parameters(&self) -> ExecutorParameters {
        ExecutorParameters::clone(&self.inner.parameters.load())
    }

    pub fn execute<F>(&self, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(None, Box::new(task))
    }

    /// Like [`execute`](Self::execute), tagging the task with a trace id that
    /// shows up in execution-timeout warnings.
    pub fn execute_traced<F>(&self, trace: impl Into<String>, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Some(trace.into()), Box::new(task))
    }

    fn submit(&self, trace: Option<String>, task: Task) -> Result<(), ExecutorError> {
        let task = match &self.inner.decorator {
            Some(decorator) => decorator.decorate(task),
            None => task,
        };
        let mut job = Job {
            id: self.inner.next_task_id.fetch_add(1, Ordering::Relaxed),
            trace,
            task,
        };

        loop {
            let pool = self.inner.live.load_full();
            match pool.execute(job) {
                Admission::Accepted | Admission::Discarded => return Ok(()),
                Admission::CallerRuns(job) => {
                    pool.run_on_caller(job);
                    return Ok(());
                }
                Admission::Aborted { max_pool_size } => {
                    return Err(ExecutorError::Rejected {
                        pool_id: self.inner.pool_id.clone(),
                        max_pool_size,
                    });
                }
                Admission::Shutdown => {
                    return Err(ExecutorError::Shutdown(self.inner.pool_id.clone()));
                }
                Admission::SpawnFailed(source) => {
                    return Err(ExecutorError::WorkerSpawn {
                        pool_id: self.inner.pool_id.clone(),
                        source,
                    });
                }
                Admission::Retired(returned) => {
                    // a replacement is being swapped in
                    job = returned;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Apply new parameters.
    ///
    /// Invalid parameters are refused before anything changes. Calls for the
    /// same executor are serialized.
    pub fn reconfigure(&self, next: &ExecutorParameters) -> Result<Reconfiguration, ExecutorError> {
        next.validate()?;

        let _serial = self.inner.reconfigure_lock.lock();
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ExecutorError::Shutdown(self.inner.pool_id.clone()));
        }

        let current = self.inner.parameters.load_full();
        if *current == *next {
            return Ok(Reconfiguration::Unchanged);
        }

        self.inner
            .counters
            .execution_timeout_ms
            .store(next.execution_timeout_ms, Ordering::Relaxed);

        if !current.requires_new_queue(next) {
            self.inner.live.load().apply(next);
            self.inner.parameters.store(Arc::new(next.clone()));
            info!(
                pool = %self.inner.pool_id,
                core = next.core_pool_size,
                max = next.max_pool_size,
                "reconfigured pool in place"
            );
            return Ok(Reconfiguration::InPlace);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let replacement = Arc::new(ThreadPool::new(
            &self.inner.pool_id,
            generation,
            next,
            Arc::clone(&self.inner.counters),
        ));

        let retired = self.inner.live.load_full();
        let pending = retired.retire();
        let moved = pending.len();
        replacement.adopt(pending);
        self.inner.live.store(replacement);
        self.inner.parameters.store(Arc::new(next.clone()));

        debug!(retired = retired.name(), "old generation draining");
        info!(
            pool = %self.inner.pool_id,
            queue = %next.queue_kind,
            capacity = next.queue_capacity,
            moved,
            "replaced pool queue"
        );
        Ok(Reconfiguration::Replaced { moved })
    }

    pub fn sample(&self) -> PoolSample {
        let params = self.inner.parameters.load();
        let counters = &self.inner.counters;

        PoolSample {
            active_count: counters.active.load(Ordering::SeqCst),
            pool_size: counters.pool_size.load(Ordering::SeqCst),
            largest_pool_size: counters.largest_pool_size.load(Ordering::SeqCst),
            core_pool_size: params.core_pool_size,
            max_pool_size: params.max_pool_size,
            queue_size: counters.queue_size.load(Ordering::SeqCst),
            queue_capacity: params.queue_bound(),
            completed_task_count: counters.completed.load(Ordering::SeqCst),
            reject_count: counters.rejected.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting tasks; queued and running tasks still complete.
    pub fn shutdown(&self) {
        let _serial = self.inner.reconfigure_lock.lock();
        if !self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!(pool = %self.inner.pool_id, "shutting down");
        }
        self.inner.live.load().shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Block until every worker, including those of replaced generations, has
    /// exited. Returns `false` if the timeout passed first.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.counters.wait_for_workers(timeout)
    }
}
