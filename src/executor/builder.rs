use std::sync::Arc;
use std::time::Duration;

use crate::error::ValidationError;
use crate::model::{ExecutorParameters, QueueKind, RejectionPolicyKind};

use super::DynamicExecutor;
use super::task::{SpanPropagation, TaskDecorator};

/// Fluent construction of a [`DynamicExecutor`].
///
/// Pools are registered explicitly after `build()`; nothing intercepts
/// construction behind the caller's back.
pub struct ExecutorBuilder {
    pool_id: String,
    parameters: ExecutorParameters,
    decorator: Option<Arc<dyn TaskDecorator>>,
}

impl ExecutorBuilder {
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            parameters: ExecutorParameters::default(),
            decorator: Some(Arc::new(SpanPropagation)),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn current_parameters(&self) -> &ExecutorParameters {
        &self.parameters
    }

    /// Replace every parameter at once, e.g. with what the server returned.
    pub fn parameters(mut self, parameters: ExecutorParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn core_pool_size(mut self, size: usize) -> Self {
        self.parameters.core_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.parameters.max_pool_size = size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.parameters.keep_alive_secs = keep_alive.as_secs();
        self
    }

    pub fn allow_core_thread_timeout(mut self, allow: bool) -> Self {
        self.parameters.allow_core_thread_timeout = allow;
        self
    }

    pub fn queue(mut self, kind: QueueKind, capacity: usize) -> Self {
        self.parameters.queue_kind = kind;
        self.parameters.queue_capacity = capacity;
        self
    }

    pub fn rejection_policy(mut self, policy: RejectionPolicyKind) -> Self {
        self.parameters.rejection_policy = policy;
        self
    }

    /// Warn about tasks running longer than `timeout`; zero disables it.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.parameters.execution_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn decorator(mut self, decorator: impl TaskDecorator + 'static) -> Self {
        self.decorator = Some(Arc::new(decorator));
        self
    }

    pub fn without_decorator(mut self) -> Self {
        self.decorator = None;
        self
    }

    pub fn build(self) -> Result<DynamicExecutor, ValidationError> {
        self.parameters.validate()?;
        Ok(DynamicExecutor::new(
            self.pool_id,
            self.parameters,
            self.decorator,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_builder_sets_parameters() {
        let executor = ExecutorBuilder::new("orders")
            .core_pool_size(2)
            .max_pool_size(4)
            .queue(QueueKind::Array, 16)
            .rejection_policy(RejectionPolicyKind::CallerRuns)
            .execution_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        let params = executor.parameters();
        assert_eq!(params.core_pool_size, 2);
        assert_eq!(params.max_pool_size, 4);
        assert_eq!(params.queue_kind, QueueKind::Array);
        assert_eq!(params.queue_capacity, 16);
        assert_eq!(params.rejection_policy, RejectionPolicyKind::CallerRuns);
        assert_eq!(params.execution_timeout_ms, 250);
        assert_eq!(executor.pool_id(), "orders");

        executor.shutdown();
    }

    #[test]
    fn test_builder_validates() {
        let result = ExecutorBuilder::new("orders")
            .core_pool_size(8)
            .max_pool_size(2)
            .build();
        assert_matches!(result, Err(ValidationError::CoreExceedsMax { core: 8, max: 2 }));
    }
}
