//! One generation of a dynamic executor's thread pool
//!
//! Admission follows the classic order: start a core worker, else queue,
//! else start a non-core worker up to the max, else apply the rejection
//! policy. Counters live outside the generation so they survive a queue
//! replacement.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::model::{ExecutorParameters, QueueKind, RejectionPolicyKind};

use super::task::Job;

/// Lock-free counters shared by every generation of one executor
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) active: AtomicUsize,
    pub(crate) pool_size: AtomicUsize,
    pub(crate) largest_pool_size: AtomicUsize,
    pub(crate) queue_size: AtomicUsize,
    pub(crate) completed: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) execution_timeout_ms: AtomicU64,
    exit_lock: Mutex<()>,
    exited: Condvar,
}

impl Counters {
    fn notify_exit(&self) {
        let _guard = self.exit_lock.lock();
        self.exited.notify_all();
    }

    /// Block until no worker of any generation is alive, or the timeout passes.
    pub(crate) fn wait_for_workers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.exit_lock.lock();
        while self.pool_size.load(Ordering::SeqCst) > 0 {
            if self.exited.wait_until(&mut guard, deadline).timed_out() {
                return self.pool_size.load(Ordering::SeqCst) == 0;
            }
        }
        true
    }

    fn check_timeout(&self, pool: &str, task_id: u64, trace: Option<&str>, elapsed: Duration) {
        let timeout_ms = self.execution_timeout_ms.load(Ordering::Relaxed);
        if timeout_ms == 0 || elapsed <= Duration::from_millis(timeout_ms) {
            return;
        }
        warn!(
            pool,
            task_id,
            trace = trace.unwrap_or("-"),
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms,
            "task execution exceeded timeout"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    /// No new tasks; queued ones still run
    Shutdown,
    /// Replaced by a newer generation; the queue has been handed over
    Retired,
}

#[derive(Debug)]
struct State {
    queue: VecDeque<Job>,
    bound: Option<usize>,
    synchronous: bool,
    core: usize,
    max: usize,
    keep_alive: Duration,
    allow_core_timeout: bool,
    policy: RejectionPolicyKind,
    workers: usize,
    idle: usize,
    lifecycle: Lifecycle,
    spawned: usize,
}

impl State {
    fn new(params: &ExecutorParameters) -> Self {
        let mut state = Self {
            queue: VecDeque::new(),
            bound: params.queue_bound(),
            synchronous: params.queue_kind == QueueKind::Synchronous,
            core: 0,
            max: 0,
            keep_alive: Duration::ZERO,
            allow_core_timeout: false,
            policy: RejectionPolicyKind::default(),
            workers: 0,
            idle: 0,
            lifecycle: Lifecycle::Running,
            spawned: 0,
        };
        state.apply(params);
        state
    }

    fn apply(&mut self, params: &ExecutorParameters) {
        self.core = params.core_pool_size;
        self.max = params.max_pool_size;
        self.keep_alive = Duration::from_secs(params.keep_alive_secs);
        self.allow_core_timeout = params.allow_core_thread_timeout;
        self.policy = params.rejection_policy;
        if params.queue_kind == QueueKind::ResizableLinked {
            self.bound = params.queue_bound();
        }
    }

    fn has_room(&self) -> bool {
        if self.synchronous {
            // hand-off only succeeds if an idle worker is there to take it
            return self.idle > self.queue.len();
        }
        self.bound.is_none_or(|bound| self.queue.len() < bound)
    }
}

/// Result of offering a job to a generation
pub(crate) enum Admission {
    Accepted,
    Discarded,
    CallerRuns(Job),
    Aborted { max_pool_size: usize },
    Retired(Job),
    Shutdown,
    SpawnFailed(std::io::Error),
}

struct Shared {
    name: String,
    state: Mutex<State>,
    work_available: Condvar,
    counters: Arc<Counters>,
}

pub(crate) struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub(crate) fn new(
        pool_id: &str,
        generation: u64,
        params: &ExecutorParameters,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: format!("{pool_id}-g{generation}"),
                state: Mutex::new(State::new(params)),
                work_available: Condvar::new(),
                counters,
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn execute(&self, job: Job) -> Admission {
        let mut state = self.shared.state.lock();
        match state.lifecycle {
            Lifecycle::Retired => return Admission::Retired(job),
            Lifecycle::Shutdown => return Admission::Shutdown,
            Lifecycle::Running => {}
        }

        if state.workers < state.core {
            return self.shared.add_worker(&mut state, Some(job));
        }

        if state.has_room() {
            state.queue.push_back(job);
            self.shared.counters.queue_size.fetch_add(1, Ordering::SeqCst);
            self.shared.work_available.notify_one();
            return Admission::Accepted;
        }

        if state.workers < state.max {
            return self.shared.add_worker(&mut state, Some(job));
        }

        self.shared.reject(&mut state, job)
    }

    /// Run a task on the submitting thread (caller-runs policy).
    pub(crate) fn run_on_caller(&self, job: Job) {
        let Job { id, trace, task } = job;
        let started = Instant::now();
        task();
        self.shared
            .counters
            .check_timeout(&self.shared.name, id, trace.as_deref(), started.elapsed());
    }

    /// Apply parameters that do not need a new queue.
    pub(crate) fn apply(&self, params: &ExecutorParameters) {
        let mut state = self.shared.state.lock();
        state.apply(params);

        // a raised core size picks up already queued work right away
        let missing = state
            .core
            .saturating_sub(state.workers)
            .min(state.queue.len());
        for _ in 0..missing {
            if let Admission::SpawnFailed(e) = self.shared.add_worker(&mut state, None) {
                warn!(pool = %self.shared.name, "could not grow pool: {e}");
                break;
            }
        }

        // idle workers re-check their limits
        self.shared.work_available.notify_all();
    }

    /// Stop accepting tasks and hand back everything not yet started, in FIFO order.
    pub(crate) fn retire(&self) -> Vec<Job> {
        let mut state = self.shared.state.lock();
        state.lifecycle = Lifecycle::Retired;
        let pending: Vec<Job> = state.queue.drain(..).collect();
        self.shared
            .counters
            .queue_size
            .fetch_sub(pending.len(), Ordering::SeqCst);
        self.shared.work_available.notify_all();
        debug!(pool = %self.shared.name, pending = pending.len(), "generation retired");
        pending
    }

    /// Take over the pending tasks of a retired generation.
    ///
    /// Handed-over tasks are accepted even beyond the new queue's bound;
    /// the bound applies to new submissions only.
    pub(crate) fn adopt(&self, pending: Vec<Job>) {
        if pending.is_empty() {
            return;
        }

        let mut state = self.shared.state.lock();
        let count = pending.len();
        state.queue.extend(pending);
        self.shared.counters.queue_size.fetch_add(count, Ordering::SeqCst);

        let wanted = state.core.min(count).saturating_sub(state.workers);
        for _ in 0..wanted {
            if let Admission::SpawnFailed(e) = self.shared.add_worker(&mut state, None) {
                warn!(pool = %self.shared.name, "could not start worker for adopted tasks: {e}");
                break;
            }
        }
        self.shared.work_available.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Shutdown;
        }
        self.shared.work_available.notify_all();
    }
}

impl Shared {
    fn add_worker(self: &Arc<Self>, state: &mut State, first: Option<Job>) -> Admission {
        let index = state.spawned;
        state.spawned += 1;
        state.workers += 1;

        let has_first = first.is_some();
        let size = self.counters.pool_size.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .largest_pool_size
            .fetch_max(size, Ordering::SeqCst);
        if has_first {
            self.counters.active.fetch_add(1, Ordering::SeqCst);
        }

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-{index}", self.name))
            .spawn(move || shared.work(first));

        match spawned {
            Ok(_) => Admission::Accepted,
            Err(e) => {
                state.workers -= 1;
                self.counters.pool_size.fetch_sub(1, Ordering::SeqCst);
                if has_first {
                    self.counters.active.fetch_sub(1, Ordering::SeqCst);
                }
                Admission::SpawnFailed(e)
            }
        }
    }

    fn reject(&self, state: &mut State, job: Job) -> Admission {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);

        match state.policy {
            RejectionPolicyKind::Abort => Admission::Aborted {
                max_pool_size: state.max,
            },
            RejectionPolicyKind::Discard => {
                debug!(pool = %self.name, task_id = job.id, "discarded task");
                Admission::Discarded
            }
            RejectionPolicyKind::DiscardOldest => match state.queue.pop_front() {
                Some(evicted) => {
                    debug!(pool = %self.name, task_id = evicted.id, "evicted oldest queued task");
                    state.queue.push_back(job);
                    self.work_available.notify_one();
                    Admission::Accepted
                }
                None => Admission::Discarded,
            },
            RejectionPolicyKind::CallerRuns => Admission::CallerRuns(job),
        }
    }

    fn work(self: Arc<Self>, first: Option<Job>) {
        trace!(pool = %self.name, "worker started");

        let mut next = first;
        loop {
            let job = match next.take() {
                Some(job) => job,
                None => match self.next_job() {
                    Some(job) => job,
                    None => break,
                },
            };
            self.run(job);
        }

        self.counters.notify_exit();
        trace!(pool = %self.name, "worker exited");
    }

    /// Wait for the next queued job; `None` means this worker should exit.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let mut timed_out = false;

        loop {
            if state.lifecycle != Lifecycle::Running && state.queue.is_empty() {
                break;
            }

            let timed = state.allow_core_timeout || state.workers > state.core;
            let over_max =
                state.workers > state.max && (state.workers > 1 || state.queue.is_empty());
            if over_max || (timed && timed_out && state.queue.is_empty()) {
                break;
            }

            if let Some(job) = state.queue.pop_front() {
                self.counters.queue_size.fetch_sub(1, Ordering::SeqCst);
                self.counters.active.fetch_add(1, Ordering::SeqCst);
                return Some(job);
            }

            state.idle += 1;
            if timed {
                let keep_alive = state.keep_alive;
                timed_out = self
                    .work_available
                    .wait_for(&mut state, keep_alive)
                    .timed_out();
            } else {
                self.work_available.wait(&mut state);
            }
            state.idle -= 1;
        }

        state.workers -= 1;
        self.counters.pool_size.fetch_sub(1, Ordering::SeqCst);
        None
    }

    fn run(&self, job: Job) {
        let Job { id, trace, task } = job;
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(task));

        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        if outcome.is_err() {
            error!(pool = %self.name, task_id = id, "task panicked");
        }
        self.counters
            .check_timeout(&self.name, id, trace.as_deref(), started.elapsed());
    }
}
