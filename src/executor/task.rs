use std::fmt;

/// A unit of work accepted by a dynamic executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Wraps every task at submission time, e.g. to carry context into the worker.
///
/// The decorator belongs to the executor, not to a pool generation, so it
/// keeps applying after the underlying queue has been replaced.
pub trait TaskDecorator: Send + Sync {
    fn decorate(&self, task: Task) -> Task;
}

/// Re-enters the submitter's `tracing` span on the worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpanPropagation;

impl TaskDecorator for SpanPropagation {
    fn decorate(&self, task: Task) -> Task {
        let span = tracing::Span::current();
        Box::new(move || {
            let _entered = span.enter();
            task()
        })
    }
}

/// A submitted task plus the bookkeeping the pool needs
pub(crate) struct Job {
    pub(crate) id: u64,
    pub(crate) trace: Option<String>,
    pub(crate) task: Task,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}
